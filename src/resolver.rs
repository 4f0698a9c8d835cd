//! Response resolution.
//!
//! Turns a matched rule plus the original request into a concrete
//! response: literal text, file contents read fresh from disk, or the
//! relayed reply of an upstream server.

use crate::config::{ResponseBody, ResponseDefinition};
use crate::matcher::RequestContext;
use crate::proxy::{Forwarder, ProxyError};
use bytes::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{HeaderMap, Request, StatusCode, Uri};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// A fully materialized response, independent of the transport.
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseDescriptor {
    /// 200 response with the given body and content type.
    pub fn ok(body: impl Into<Bytes>, content_type: Option<&'static str>) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        Self {
            status: StatusCode::OK,
            headers,
            body: body.into(),
        }
    }

    /// Error response with a small JSON body.
    pub fn error(status: StatusCode, error: &str, message: &str) -> Self {
        let body = serde_json::json!({ "error": error, "message": message });
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    /// Lay the rule's status and headers over this response.
    fn overlay(mut self, response: &ResponseDefinition) -> Self {
        if let Some(status) = response.status {
            self.status = status;
        }
        for (name, value) in &response.headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }
}

/// Failures while producing a response for a matched rule.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot read response file {path}: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("proxy to {url} failed: {source}")]
    Proxy { url: Uri, source: ProxyError },
}

impl ResolveError {
    /// Error response sent to the client in place of the rule's response.
    pub fn to_response(&self) -> ResponseDescriptor {
        match self {
            ResolveError::Source { .. } => ResponseDescriptor::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "source_failure",
                &self.to_string(),
            ),
            ResolveError::Proxy {
                source: ProxyError::Timeout(_),
                ..
            } => ResponseDescriptor::error(
                StatusCode::GATEWAY_TIMEOUT,
                "proxy_timeout",
                &self.to_string(),
            ),
            ResolveError::Proxy { .. } => ResponseDescriptor::error(
                StatusCode::BAD_GATEWAY,
                "proxy_failure",
                &self.to_string(),
            ),
        }
    }
}

/// Response returned when no rule matches. Always the same.
pub fn no_match_response() -> ResponseDescriptor {
    ResponseDescriptor::error(StatusCode::NOT_FOUND, "not_found", "No matching rule found")
}

/// Resolves rule responses. Holds the upstream forwarder used by proxy
/// responses; everything else is read from the rule itself.
#[derive(Clone)]
pub struct ResponseResolver {
    forwarder: Arc<dyn Forwarder>,
}

impl ResponseResolver {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Build the response for a matched rule.
    pub async fn resolve(
        &self,
        response: &ResponseDefinition,
        ctx: &RequestContext,
    ) -> Result<ResponseDescriptor, ResolveError> {
        let content_type = response.body.content_type();

        let descriptor = match &response.body {
            ResponseBody::Text(text) => ResponseDescriptor::ok(text.clone(), content_type),
            ResponseBody::File(path) => {
                let content =
                    tokio::fs::read(path)
                        .await
                        .map_err(|source| ResolveError::Source {
                            path: path.clone(),
                            source,
                        })?;
                ResponseDescriptor::ok(content, content_type)
            }
            ResponseBody::Proxy(target) => self.proxy(&target.url, ctx).await?,
        };

        Ok(descriptor.overlay(response))
    }

    async fn proxy(
        &self,
        url: &Uri,
        ctx: &RequestContext,
    ) -> Result<ResponseDescriptor, ResolveError> {
        let mut req = Request::new(ctx.body().clone());
        *req.method_mut() = ctx.method().clone();
        *req.uri_mut() = url.clone();
        *req.headers_mut() = ctx.headers().clone();

        let res = self
            .forwarder
            .forward(req)
            .await
            .map_err(|source| ResolveError::Proxy {
                url: url.clone(),
                source,
            })?;

        let (parts, body) = res.into_parts();
        Ok(ResponseDescriptor {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}
