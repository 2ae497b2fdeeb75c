//! The error taxonomy surfaced to callers.
//!
//! Transport-level failures are absorbed by the reconnect supervisor and
//! reach callers only as per-request [`SessionError::TransportLost`].
//! Timeouts and remote errors are per-request and never tear the connection.

use tl_protocol::{ErrorRes, WireError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Call made before authentication completed (or after disconnect).
    #[error("session is not ready")]
    NotReady,
    /// The request deadline elapsed with no response.
    #[error("request timed out")]
    Timeout,
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The connection died while the request was in flight.
    #[error("transport lost")]
    TransportLost,
    /// The server answered with its generic error message.
    #[error("remote error {code}: {description}")]
    Remote {
        code: String,
        description: String,
        maintenance_end_ms: Option<u64>,
    },
    /// Framing or envelope violation; fatal for the current connection.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Non-retriable authentication failure; the session is finished.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The session or subscription was closed.
    #[error("session closed")]
    Closed,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

impl SessionError {
    /// Build the per-request error for a decoded remote error body.
    pub fn remote(body: ErrorRes) -> Self {
        SessionError::Remote {
            code: body.error_code,
            description: body.description,
            maintenance_end_ms: body.maintenance_end_ms,
        }
    }

    /// The remote error code, when this is a remote error.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            SessionError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}
