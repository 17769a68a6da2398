//! Control endpoint
//!
//! The single external operation is the reload trigger. Two listener forms
//! share it, selected by the configured control address:
//!
//! - HTTP on a TCP socket: `POST /reload` returns `200 OK` on success and
//!   `500` with the error text on failure. Anything else is `404`.
//! - A UNIX socket taking line-oriented commands; only `reload` is known,
//!   unknown commands are logged.
//!
//! The endpoint is idempotent from the caller's perspective: concurrent
//! triggers are absorbed by the reload state machine's coalescing, so every
//! handler simply calls [`ReloadController::reload`] and reports the result.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ControlAddress;
use crate::error::ControlError;
use crate::reload::ReloadController;

enum ControlListener {
    Http(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Server for the reload trigger
pub struct ControlServer {
    listener: ControlListener,
    controller: Arc<ReloadController>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    /// Bind the configured control address.
    ///
    /// A stale UNIX socket file left by a previous run is removed before
    /// binding.
    ///
    /// # Errors
    ///
    /// [`ControlError::Bind`] when the listener cannot be created.
    pub async fn bind(
        address: &ControlAddress,
        controller: Arc<ReloadController>,
    ) -> Result<Self, ControlError> {
        let listener = match address {
            ControlAddress::Http(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| ControlError::bind(addr.to_string(), e.to_string()))?;
                ControlListener::Http(listener)
            }
            ControlAddress::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(|e| {
                        ControlError::bind(
                            path.display().to_string(),
                            format!("couldn't remove stale socket: {e}"),
                        )
                    })?;
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| ControlError::bind(path.display().to_string(), e.to_string()))?;
                ControlListener::Unix(listener, path.clone())
            }
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            controller,
            shutdown_tx,
        })
    }

    /// Actual bound address of the HTTP form; `None` for the UNIX form.
    /// Useful when binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            ControlListener::Http(listener) => listener.local_addr().ok(),
            ControlListener::Unix(..) => None,
        }
    }

    /// Sender that stops the accept loop.
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns accept-loop I/O failures; individual connection errors are
    /// logged and do not stop the server.
    pub async fn run(self) -> Result<(), ControlError> {
        let Self {
            listener,
            controller,
            shutdown_tx,
        } = self;
        let shutdown_rx = shutdown_tx.subscribe();
        match listener {
            ControlListener::Http(listener) => run_http(listener, controller, shutdown_rx).await,
            ControlListener::Unix(listener, path) => {
                let result = run_unix(listener, controller, shutdown_rx).await;
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                result
            }
        }
    }
}

async fn run_http(
    listener: TcpListener,
    controller: Arc<ReloadController>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ControlError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Control endpoint listening on http://{addr}");
    }
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("control accept error: {e}");
                        continue;
                    }
                };
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let controller = Arc::clone(&controller);
                        async move {
                            Ok::<_, Infallible>(handle_request(&req, &controller).await)
                        }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                        debug!("control connection from {peer} ended: {e}");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!("Control endpoint shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_request(
    req: &Request<Incoming>,
    controller: &ReloadController,
) -> Response<Full<Bytes>> {
    if req.method() == Method::POST && req.uri().path() == "/reload" {
        match controller.reload().await {
            Ok(()) => text_response(StatusCode::OK, "OK\n"),
            Err(e) => {
                error!("Couldn't reload: {e}");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n"))
            }
        }
    } else {
        text_response(StatusCode::NOT_FOUND, "Not Found\n")
    }
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
}

async fn run_unix(
    listener: UnixListener,
    controller: Arc<ReloadController>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ControlError> {
    info!("Control endpoint listening on UNIX socket");
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("control accept error: {e}");
                        continue;
                    }
                };
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    if let Err(e) = handle_unix_connection(stream, &controller).await {
                        debug!("control connection ended: {e}");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!("Control endpoint shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_unix_connection(
    mut stream: tokio::net::UnixStream,
    controller: &ReloadController,
) -> std::io::Result<()> {
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;
    let command = raw.trim();
    match command {
        "reload" => match controller.reload().await {
            Ok(()) => stream.write_all(b"OK\n").await?,
            Err(e) => {
                error!("Couldn't reload: {e}");
                stream.write_all(format!("{e}\n").as_bytes()).await?;
            }
        },
        other => {
            warn!("Unknown command: {other}");
            stream
                .write_all(format!("Unknown command: {other}\n").as_bytes())
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::haproxy::HaproxyDaemon;
    use crate::netqueue::NullNetQueue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UnixStream};

    fn controller_with_binary(binary: &str) -> Arc<ReloadController> {
        let daemon = HaproxyDaemon::new(binary, "/nonexistent/pidfile", "/dev/null");
        Arc::new(ReloadController::new(
            Arc::new(daemon),
            Arc::new(NullNetQueue),
        ))
    }

    async fn http_round_trip(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        // `Connection: close` makes the server end the stream after the
        // response, so read-to-EOF collects the whole reply.
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_http_reload_ok() {
        let address = ControlAddress::Http("127.0.0.1:0".parse().unwrap());
        let server = ControlServer::bind(&address, controller_with_binary("/bin/true"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_sender();
        let handle = tokio::spawn(server.run());

        let response = http_round_trip(
            addr,
            "POST /reload HTTP/1.1\r\nHost: control\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.contains("OK"));

        let _ = shutdown.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http_reload_failure_is_500() {
        let address = ControlAddress::Http("127.0.0.1:0".parse().unwrap());
        let server = ControlServer::bind(&address, controller_with_binary("/bin/false"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_sender();
        let handle = tokio::spawn(server.run());

        let response = http_round_trip(
            addr,
            "POST /reload HTTP/1.1\r\nHost: control\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");

        let _ = shutdown.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http_unknown_route_is_404() {
        let address = ControlAddress::Http("127.0.0.1:0".parse().unwrap());
        let server = ControlServer::bind(&address, controller_with_binary("/bin/true"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_sender();
        let handle = tokio::spawn(server.run());

        let response = http_round_trip(
            addr,
            "GET /reload HTTP/1.1\r\nHost: control\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");

        let _ = shutdown.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unix_socket_commands() {
        let path = std::env::temp_dir().join(format!("supervisor-ctl-{}.sock", std::process::id()));
        let address = ControlAddress::Unix(path.clone());
        let server = ControlServer::bind(&address, controller_with_binary("/bin/true"))
            .await
            .unwrap();
        let shutdown = server.shutdown_sender();
        let handle = tokio::spawn(server.run());

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"reload\n").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "OK\n");

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"restart\n").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("Unknown command"));

        let _ = shutdown.send(());
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
