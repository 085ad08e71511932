//! Readiness probing for freshly launched backends.
//!
//! Two modes: HTTP polling against the configured method/path, or, for
//! Unix-socket upstreams without an HTTP probe, polling the socket path
//! for existence. The caller owns the overall deadline; these loops run
//! until ready or until the supervisor shuts down.

use crate::upstream::{self, Upstream};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::info;

const HTTP_PROBE_INTERVAL: Duration = Duration::from_millis(200);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Poll the backend until it is ready to accept traffic.
///
/// Never resolves once the shutdown channel fires; the launcher's race
/// against the exit watcher and its deadline decide the outcome then.
pub(crate) async fn wait_until_ready(
    method: String,
    path: String,
    upstream: Upstream,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !method.is_empty() {
        let url = format!("http://{}{}", probe_host(&upstream), path);
        info!(method = %method, url = %url, "waiting for backend readiness via HTTP polling");

        let mut ticker = tokio::time::interval(HTTP_PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if http_probe(&upstream, &method, &path).await {
                        return;
                    }
                }
                // Only ever signalled on teardown; stop probing and let the
                // launcher's exit race decide.
                _ = shutdown_rx.changed() => {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    match upstream {
        Upstream::Unix { path: socket } => {
            info!(path = %socket.display(), "waiting for backend socket");
            let mut ticker = tokio::time::interval(SOCKET_PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if upstream::socket_ready(&socket) {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
        // Launch validation rejects TCP upstreams without an HTTP probe.
        Upstream::Tcp { .. } => {}
    }
}

fn probe_host(upstream: &Upstream) -> String {
    match upstream {
        Upstream::Tcp { host_port } => host_port.clone(),
        // Synthetic host for requests carried over the socket
        Upstream::Unix { .. } => "localhost".to_string(),
    }
}

/// One probe attempt. Any status in [200, 400) counts as ready.
async fn http_probe(upstream: &Upstream, method: &str, path: &str) -> bool {
    let status = match upstream {
        Upstream::Tcp { host_port } => {
            let attempt = async {
                let stream = TcpStream::connect(host_port.as_str()).await.ok()?;
                request_status(stream, method, host_port, path).await
            };
            tokio::time::timeout(HTTP_PROBE_TIMEOUT, attempt)
                .await
                .unwrap_or(None)
        }
        Upstream::Unix { path: socket } => {
            #[cfg(unix)]
            {
                let attempt = async {
                    let stream = UnixStream::connect(socket).await.ok()?;
                    request_status(stream, method, "localhost", path).await
                };
                tokio::time::timeout(HTTP_PROBE_TIMEOUT, attempt)
                    .await
                    .unwrap_or(None)
            }
            #[cfg(not(unix))]
            {
                let _ = socket;
                None
            }
        }
    };

    matches!(status, Some(code) if (200..400).contains(&code))
}

/// Issue one request and parse the response status line. Dropping the
/// stream closes the connection; the request asks the backend to do the
/// same on its side.
async fn request_status<S>(stream: S, method: &str, host: &str, path: &str) -> Option<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let path = if path.is_empty() { "/" } else { path };
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        method, path, host
    );
    stream.write_all(request.as_bytes()).await.ok()?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await.ok()?;
    status_line.split_whitespace().nth(1)?.parse::<u16>().ok()
}
