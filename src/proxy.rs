//! Upstream forwarding for proxy responses.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderName};
use hyper::{HeaderMap, Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from a forwarded exchange.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("cannot send request: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("cannot read upstream response: {0}")]
    Body(#[from] hyper::Error),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

/// Sends a fully buffered request upstream and returns the fully buffered
/// reply.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError>;
}

/// Plain HTTP/1.1 forwarder built on the hyper-util pooled client.
pub struct HttpForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout,
        }
    }

    async fn exchange(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        // The Host header names this server; hyper derives the right one
        // from the target URI.
        parts.headers.remove(header::HOST);
        strip_hop_by_hop(&mut parts.headers);

        let res = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await?;

        let (mut parts, body) = res.into_parts();
        let body = body.collect().await?.to_bytes();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        debug!(method = %req.method(), uri = %req.uri(), "Forwarding request upstream");
        tokio::time::timeout(self.timeout, self.exchange(req))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))?
    }
}

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
