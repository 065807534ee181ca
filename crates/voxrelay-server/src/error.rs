//! Session-level error taxonomy.

use crate::codec::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Why a relay session (or one message within it) failed.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A single client message was malformed or too large. The session
    /// keeps running.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The engine connection could not be established.
    #[error("engine connection failed: {0}")]
    UpstreamConnect(String),

    /// The engine connection broke, timed out, or reported an error.
    #[error("engine stream failed: {0}")]
    UpstreamStream(String),

    /// The client did not acknowledge a heartbeat in time.
    #[error("client heartbeat not confirmed within {0:?}")]
    HeartbeatTimeout(Duration),

    /// The client socket is gone.
    #[error("client connection closed")]
    TransportClosed,

    /// A relay task panicked.
    #[error("internal relay failure: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Codec(_))
    }

    /// Text sent to the client in an `error` message, if the client should
    /// hear about this failure at all.
    pub fn client_notice(&self) -> Option<String> {
        match self {
            RelayError::Codec(e) => Some(e.to_string()),
            RelayError::UpstreamConnect(_) => {
                Some("could not reach the speech engine".to_string())
            }
            RelayError::UpstreamStream(_) => Some("speech engine connection lost".to_string()),
            RelayError::Internal(_) => Some("internal server error".to_string()),
            RelayError::HeartbeatTimeout(_) | RelayError::TransportClosed => None,
        }
    }
}
