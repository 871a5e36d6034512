//! HTTP Server for a jscgi worker
//!
//! Accepts connections with hyper's HTTP/1.1 server and hands every request
//! to the worker's [`Dispatcher`]. Everything runs on the worker's
//! `LocalSet`: connections are spawned with `spawn_local`, because the
//! dispatcher and the script runtime behind it are single-threaded.
//!
//! Listeners are bound with `SO_REUSEPORT`, so every worker in the pool binds
//! the same address and the kernel spreads connections across them.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::rc::Rc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use jscgi_common::{CgiError, ExecutionResult, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::dispatch::Dispatcher;

/// Binds a non-blocking listener that other workers may bind too.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |e: std::io::Error| CgiError::Transport(format!("Failed to bind to {}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

pub struct HttpServer {
    dispatcher: Rc<Dispatcher>,
}

impl HttpServer {
    pub fn new(dispatcher: Rc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serves connections from `listener` until accepting fails.
    ///
    /// Must be polled inside a `LocalSet`.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| CgiError::Transport(format!("Failed to accept connection: {}", e)))?;

            let io = TokioIo::new(stream);
            let dispatcher = self.dispatcher.clone();

            tokio::task::spawn_local(async move {
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { Self::handle_request(dispatcher, req, peer).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("Error serving connection from {}: {}", peer, err);
                }
            });
        }
    }

    async fn handle_request(
        dispatcher: Rc<Dispatcher>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let result = dispatcher.dispatch(req, peer).await;
        Ok(into_response(result))
    }
}

/// Converts an [`ExecutionResult`] into a hyper response.
///
/// Headers that are not valid HTTP are dropped with a warning rather than
/// failing the whole response.
pub fn into_response(result: ExecutionResult) -> Response<Full<Bytes>> {
    let body = result.body_bytes();
    let mut response = Response::new(Full::new(Bytes::from(body)));

    *response.status_mut() = StatusCode::from_u16(result.status).unwrap_or_else(|_| {
        tracing::warn!("Invalid status code {}, sending 500", result.status);
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let headers = response.headers_mut();
    for (name, value) in result.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!("Dropping invalid response header {:?}: {:?}", name, value),
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use jscgi_common::ErrorPayload;

    #[tokio::test]
    async fn test_into_response_copies_status_headers_and_body() {
        let result = ExecutionResult::output(
            201,
            vec![
                ("content-type".into(), "text/plain".into()),
                ("x-bad header".into(), "dropped".into()),
            ],
            b"created".to_vec(),
        );
        let response = into_response(result);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers().len(), 1);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn test_error_payload_is_json() {
        let result = ExecutionResult::error(
            500,
            ErrorPayload {
                error: "Error: boom".into(),
                stack: "Error: boom\n    at x.js".into(),
            },
        );
        let response = into_response(result);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Error: boom");
    }

    #[tokio::test]
    async fn test_two_listeners_share_a_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_listener(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }
}
