//! Error types for pipeplex.

use thiserror::Error;

/// Main error type for all pipeplex operations.
#[derive(Debug, Error)]
pub enum PipeplexError {
    /// I/O error on a pipe/socket (broken or reset transport).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (oversized length prefix, truncated handshake, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Payload was not valid UTF-8.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Serialization error raised by a user-supplied codec.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A notification handler returned an error or panicked.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue limit reached; the message was dropped.
    #[error("Outbound queue full")]
    QueueFull,

    /// A bounded wait elapsed.
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// The operation was cancelled by a stop request.
    #[error("Cancelled")]
    Cancelled,
}

/// Coarse classification of [`PipeplexError`] used for loop policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure, always fatal for the owning connection.
    Transport,
    /// Malformed frame.
    Protocol,
    /// Payload could not be encoded or decoded.
    Serialization,
    /// User handler fault.
    Handler,
    /// Connection already closed.
    Closed,
    /// Outbound queue limit reached.
    Backpressure,
    /// Bounded wait elapsed.
    Timeout,
    /// Stop requested.
    Cancelled,
}

impl PipeplexError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipeplexError::Io(_) => ErrorKind::Transport,
            PipeplexError::Protocol(_) => ErrorKind::Protocol,
            PipeplexError::Json(_)
            | PipeplexError::MsgPackEncode(_)
            | PipeplexError::MsgPackDecode(_)
            | PipeplexError::Utf8(_)
            | PipeplexError::Serialization(_) => ErrorKind::Serialization,
            PipeplexError::Handler(_) => ErrorKind::Handler,
            PipeplexError::ConnectionClosed => ErrorKind::Closed,
            PipeplexError::QueueFull => ErrorKind::Backpressure,
            PipeplexError::Timeout(_) => ErrorKind::Timeout,
            PipeplexError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True for payload encode/decode failures.
    #[inline]
    pub fn is_serialization(&self) -> bool {
        self.kind() == ErrorKind::Serialization
    }
}

/// Result type alias using PipeplexError.
pub type Result<T> = std::result::Result<T, PipeplexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let io = PipeplexError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(io.kind(), ErrorKind::Transport);

        let utf8 = String::from_utf8(vec![0xff]).unwrap_err();
        assert!(PipeplexError::from(utf8).is_serialization());

        assert_eq!(
            PipeplexError::Protocol("bad".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(PipeplexError::QueueFull.kind(), ErrorKind::Backpressure);
        assert_eq!(PipeplexError::Timeout("dial").kind(), ErrorKind::Timeout);
        assert!(!PipeplexError::ConnectionClosed.is_serialization());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            PipeplexError::Protocol("oversized".into()).to_string(),
            "Protocol error: oversized"
        );
        assert_eq!(PipeplexError::ConnectionClosed.to_string(), "Connection closed");
    }
}
