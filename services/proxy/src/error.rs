//! Error types for the proxy front-ends.

use std::io;

use thiserror::Error;

use crate::dialer::DialError;

/// Per-connection proxy errors.
///
/// None of these are fatal to the process: a failing connection is logged
/// and dropped while the listener keeps accepting.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client supplied missing or wrong credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Outbound connection could not be established.
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// Read/write error while tunneling an established connection.
    #[error("relay error: {0}")]
    Relay(#[source] io::Error),

    /// Client spoke something other than the expected protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error on the client connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Short, stable reason code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::AuthenticationFailed => "auth_failed",
            ProxyError::Dial(_) => "dial_failed",
            ProxyError::Relay(_) => "relay_io_error",
            ProxyError::Protocol(_) => "protocol_error",
            ProxyError::Io(_) => "io_error",
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ProxyError::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(ProxyError::AuthenticationFailed.reason_code(), "auth_failed");
        assert_eq!(ProxyError::protocol("bad").reason_code(), "protocol_error");
        assert_eq!(
            ProxyError::Relay(io::Error::other("reset")).reason_code(),
            "relay_io_error"
        );
        assert_eq!(
            ProxyError::from(io::Error::other("eof")).reason_code(),
            "io_error"
        );
    }
}
