//! Error kinds surfaced to the host, and JSON error responses for hosts
//! that want to render them directly.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Errors produced while selecting or starting a backend.
///
/// Every variant is fatal to the request that triggered it but not to the
/// handler: the next request re-enters the lifecycle from a clean slot.
#[derive(Debug)]
pub enum Error {
    /// The upstream descriptor could not be parsed as a TCP address.
    InvalidUpstream(String),
    /// The effective launch parameters are unusable (e.g. a TCP upstream
    /// without a readiness probe, or no executable at all).
    InvalidConfig(String),
    /// The detector did not finish within its deadline.
    DetectorTimeout,
    /// The detector exited non-zero or could not be run.
    DetectorFailed { detail: String, stdout: String },
    /// The detector's standard output was not a valid JSON object.
    DetectorBadOutput {
        error: serde_json::Error,
        stdout: String,
    },
    /// A pre-launch filesystem operation failed.
    Io(std::io::Error),
    /// The backend executable could not be spawned.
    LaunchFailed {
        executable: String,
        source: std::io::Error,
    },
    /// The backend exited before its readiness probe succeeded.
    BackendExitedDuringReadiness(String),
    /// Readiness did not succeed within the launch deadline.
    ReadinessTimeout,
    /// The Unix socket was missing or not a socket right before dispatch.
    SocketNotReady(PathBuf),
}

impl Error {
    /// HTTP status a host should render for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidUpstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::DetectorTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::DetectorFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DetectorBadOutput { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::LaunchFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendExitedDuringReadiness(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ReadinessTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Error::SocketNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable name, also used for the X-Proxy-Error header.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidUpstream(_) => "INVALID_UPSTREAM",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::DetectorTimeout => "DETECTOR_TIMEOUT",
            Error::DetectorFailed { .. } => "DETECTOR_FAILED",
            Error::DetectorBadOutput { .. } => "DETECTOR_BAD_OUTPUT",
            Error::Io(_) => "IO_ERROR",
            Error::LaunchFailed { .. } => "LAUNCH_FAILED",
            Error::BackendExitedDuringReadiness(_) => "BACKEND_EXITED_DURING_READINESS",
            Error::ReadinessTimeout => "READINESS_TIMEOUT",
            Error::SocketNotReady(_) => "SOCKET_NOT_READY",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidUpstream(addr) => write!(f, "invalid upstream address: {}", addr),
            Error::InvalidConfig(msg) => write!(f, "invalid handler configuration: {}", msg),
            Error::DetectorTimeout => write!(f, "detector timed out"),
            Error::DetectorFailed { detail, stdout } => {
                write!(f, "detector failed: {}\noutput: {}", detail, stdout)
            }
            Error::DetectorBadOutput { error, stdout } => {
                write!(
                    f,
                    "failed to decode detector output: {}\noutput: {}",
                    error, stdout
                )
            }
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::LaunchFailed { executable, source } => {
                write!(f, "failed to start backend {}: {}", executable, source)
            }
            Error::BackendExitedDuringReadiness(status) => {
                write!(f, "backend exited during readiness check: {}", status)
            }
            Error::ReadinessTimeout => write!(f, "timeout waiting for backend readiness"),
            Error::SocketNotReady(path) => {
                write!(f, "backend socket {} is not ready", path.display())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::LaunchFailed { source, .. } => Some(source),
            Error::DetectorBadOutput { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error kind
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(err: &Error) -> Self {
        Self {
            code: err.kind(),
            message: err.to_string(),
            status: err.status_code().as_u16(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header, for hosts that
/// render middleware errors themselves.
pub fn json_error_response(err: &Error) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(err).to_json();

    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", err.kind())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
