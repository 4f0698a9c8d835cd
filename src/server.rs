//! HTTP server runtime.
//!
//! Owns the listener lifecycle and the hyper decode/encode boundary. Each
//! connection runs on its own task; every request on it is buffered into a
//! [`RequestContext`], answered by the shared [`StubHandler`], and encoded
//! back onto the wire.
//!
//! Stopping closes the listener and aborts connections that are still in
//! flight; `stop` never waits on a client.

use crate::config::{ConfigError, StubServerConfig};
use crate::handler::StubHandler;
use crate::matcher::RequestContext;
use crate::proxy::Forwarder;
use crate::resolver::ResponseDescriptor;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running on {0}")]
    AlreadyRunning(SocketAddr),
    #[error("cannot bind to socket addr {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("cannot obtain local address: {0}")]
    LocalAddr(std::io::Error),
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A stub server instance: `Stopped -> start -> Running -> stop -> Stopped`.
///
/// Instances share nothing, so several can run side by side in one process.
pub struct StubServer {
    handler: Arc<StubHandler>,
    running: Option<RunningServer>,
}

impl StubServer {
    /// Create a stopped server for the given configuration.
    pub fn new(config: StubServerConfig) -> Result<Self, ConfigError> {
        Ok(Self::from_handler(StubHandler::new(config)?))
    }

    /// Create a stopped server whose proxy rules go through `forwarder`.
    pub fn with_forwarder(
        config: StubServerConfig,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::from_handler(StubHandler::with_forwarder(
            config, forwarder,
        )?))
    }

    fn from_handler(handler: StubHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            running: None,
        }
    }

    /// Start listening on `127.0.0.1:port`. Port 0 picks a free port.
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, ServerError> {
        self.start_on(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
    }

    /// Start listening on `addr` and return the bound address.
    pub async fn start_on(&mut self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        if let Some(running) = &self.running {
            return Err(ServerError::AlreadyRunning(running.local_addr));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_accept_loop(
            listener,
            self.handler.clone(),
            shutdown_rx,
        ));

        info!(addr = %local_addr, rules = self.handler.rules().len(), "Stub server listening");

        self.running = Some(RunningServer {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop the server. Does nothing when it is not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Accept loop ended abnormally");
            }
        }

        info!(addr = %running.local_addr, "Stub server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn handler(&self) -> &StubHandler {
        &self.handler
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            running.task.abort();
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    handler: Arc<StubHandler>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        connections.spawn(serve_connection(stream, remote_addr, handler.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept error");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                break;
            }
        }
    }

    drop(listener);
    connections.shutdown().await;
}

async fn serve_connection(stream: TcpStream, remote_addr: SocketAddr, handler: Arc<StubHandler>) {
    debug!(remote = %remote_addr, "New connection");

    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handle_request(handler, req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(remote = %remote_addr, error = %e, "Connection closed with error");
    }
}

async fn handle_request(handler: Arc<StubHandler>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let ctx = match decode_request(req).await {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!(error = %e, "Cannot read request body");
            return encode_response(ResponseDescriptor::error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                &format!("cannot read request body: {}", e),
            ));
        }
    };

    encode_response(handler.handle(&ctx).await)
}

async fn decode_request(req: Request<Incoming>) -> Result<RequestContext, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(RequestContext::new(parts.method, &parts.uri, parts.headers, body))
}

fn encode_response(descriptor: ResponseDescriptor) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(descriptor.body));
    *response.status_mut() = descriptor.status;
    *response.headers_mut() = descriptor.headers;
    response
}
