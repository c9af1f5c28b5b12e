//! Error types for the WebSocket connection engine.
//!
//! Every failure the engine can observe maps to one variant of [`Error`].
//! Failures detected on a live connection also carry the close code that the
//! connection is failed with (see [`Error::close_code`]).

use thiserror::Error;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The opening handshake request or response is malformed or was rejected.
    ///
    /// Never produces a live connection.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The request's Origin header is not in the allowed list.
    #[error("Origin not allowed: {0}")]
    InvalidOrigin(String),

    /// The server's request hook answered the upgrade request with a plain
    /// HTTP response instead of switching protocols.
    #[error("Handshake aborted with HTTP status {status}")]
    HandshakeAborted {
        /// Status code of the response that was sent.
        status: u16,
    },

    /// The peer violated the framing rules.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame or a reassembled message exceeds the configured maximum size.
    #[error("Payload too big: {size} bytes (max: {max})")]
    PayloadTooBig {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A text message or close reason is not valid UTF-8.
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// The connection is closing or closed.
    #[error("Connection closed: code = {code}, reason = {reason:?}")]
    ConnectionClosed {
        /// Recorded close code.
        code: u16,
        /// Recorded close reason.
        reason: String,
    },

    /// A close code that may not be sent on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// A ping with the same payload is already waiting for its pong.
    #[error("Already waiting for a pong with the same data")]
    DuplicatePing,

    /// Extension negotiation or transform failure.
    #[error("Extension error: {0}")]
    Extension(String),

    /// The WebSocket URI cannot be used.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Close code a connection is failed with when this error is detected
    /// while reading from the peer.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => 1002,
            Error::PayloadTooBig { .. } => 1009,
            Error::InvalidUtf8 => 1007,
            Error::Io(_) => 1006,
            Error::ConnectionClosed { code, .. } => *code,
            _ => 1011,
        }
    }

    /// Shorthand for building a protocol error.
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Shorthand for building a handshake error.
    pub(crate) fn handshake(msg: impl Into<String>) -> Self {
        Error::InvalidHandshake(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Error::InvalidUtf8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PayloadTooBig {
            size: 2_000_000,
            max: 1_048_576,
        };
        assert_eq!(
            err.to_string(),
            "Payload too big: 2000000 bytes (max: 1048576)"
        );
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(Error::protocol("bad").close_code(), 1002);
        assert_eq!(Error::PayloadTooBig { size: 2, max: 1 }.close_code(), 1009);
        assert_eq!(Error::InvalidUtf8.close_code(), 1007);
        assert_eq!(Error::Io("reset".into()).close_code(), 1006);
        assert_eq!(Error::Extension("zlib".into()).close_code(), 1011);
        assert_eq!(
            Error::ConnectionClosed {
                code: 4000,
                reason: String::new()
            }
            .close_code(),
            4000
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let ws_err: Error = io_err.into();
        assert!(matches!(ws_err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_utf8() {
        let err: Error = String::from_utf8(vec![0xff]).unwrap_err().into();
        assert_eq!(err, Error::InvalidUtf8);
    }
}
