//! Classification of upstream descriptors into dial forms.

use crate::error::Error;
use hyper::Uri;
use std::path::{Path, PathBuf};

/// A classified dial target.
///
/// `unix/<path>` descriptors keep their socket path; everything else is
/// normalized to a `host:port` authority. Classification happens once per
/// resolution, on the effective upstream string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// TCP loopback or remote address, dialed as `host:port`
    Tcp { host_port: String },
    /// Unix domain socket owned by the supervisor
    Unix { path: PathBuf },
}

impl Upstream {
    /// Parse an upstream descriptor.
    ///
    /// A leading `:` gets the loopback host prefixed; a missing scheme gets
    /// `http://` prepended before URL parsing. Failures surface as
    /// [`Error::InvalidUpstream`].
    pub fn classify(addr: &str) -> Result<Self, Error> {
        if let Some(path) = addr.strip_prefix("unix/") {
            #[cfg(unix)]
            {
                return Ok(Upstream::Unix {
                    path: PathBuf::from(path),
                });
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(Error::InvalidUpstream(format!(
                    "{}: unix sockets are not supported on this platform",
                    addr
                )));
            }
        }

        let mut to_addr = addr.to_string();
        if to_addr.starts_with(':') {
            to_addr = format!("127.0.0.1{}", to_addr);
        }
        if !to_addr.starts_with("http://") && !to_addr.starts_with("https://") {
            to_addr = format!("http://{}", to_addr);
        }

        let uri: Uri = to_addr
            .parse()
            .map_err(|e| Error::InvalidUpstream(format!("{}: {}", addr, e)))?;
        let authority = uri
            .authority()
            .ok_or_else(|| Error::InvalidUpstream(addr.to_string()))?;

        Ok(Upstream::Tcp {
            host_port: authority.to_string(),
        })
    }

    /// The address handed to the reverse-proxy engine: `host:port` for TCP,
    /// `unix/<path>` for sockets.
    pub fn dial_addr(&self) -> String {
        match self {
            Upstream::Tcp { host_port } => host_port.clone(),
            Upstream::Unix { path } => format!("unix/{}", path.display()),
        }
    }
}

/// True when `path` exists and is a socket.
#[cfg(unix)]
pub fn socket_ready(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn socket_ready(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_classify_unix_socket() {
        let upstream = Upstream::classify("unix//tmp/app.sock").unwrap();
        assert_eq!(
            upstream,
            Upstream::Unix {
                path: PathBuf::from("/tmp/app.sock")
            }
        );
        assert_eq!(upstream.dial_addr(), "unix//tmp/app.sock");
    }

    #[test]
    fn test_classify_port_only_defaults_to_loopback() {
        let upstream = Upstream::classify(":8080").unwrap();
        assert_eq!(
            upstream,
            Upstream::Tcp {
                host_port: "127.0.0.1:8080".to_string()
            }
        );
    }

    #[test]
    fn test_classify_host_port() {
        let upstream = Upstream::classify("localhost:3000").unwrap();
        assert_eq!(upstream.dial_addr(), "localhost:3000");
    }

    #[test]
    fn test_classify_strips_explicit_scheme() {
        let upstream = Upstream::classify("http://127.0.0.1:9000").unwrap();
        assert_eq!(upstream.dial_addr(), "127.0.0.1:9000");

        let upstream = Upstream::classify("https://127.0.0.1:9443").unwrap();
        assert_eq!(upstream.dial_addr(), "127.0.0.1:9443");
    }

    #[test]
    fn test_classify_invalid_address() {
        let err = Upstream::classify("http://[::bad").unwrap_err();
        assert_eq!(err.kind(), "INVALID_UPSTREAM");
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_ready_rejects_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"x").unwrap();
        assert!(!socket_ready(&path));
        assert!(!socket_ready(&dir.path().join("missing")));

        let sock = dir.path().join("real.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();
        assert!(socket_ready(&sock));
    }
}
