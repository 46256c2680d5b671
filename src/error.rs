//! Error types for the frame protocol and server runtime.

use thiserror::Error;

/// Errors raised while framing, transporting or setting up connections.
///
/// Framing and transport errors are fatal to the connection they occur on
/// and are reported to the [`Listener`](crate::listener::Listener). Setup
/// errors surface at construction time. Peer disconnects are not errors;
/// they arrive as the severed-connection sentinel frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A fixed-width header field held something other than digits.
    #[error("malformed {field} field: {found:?}")]
    MalformedField {
        /// Name of the offending field.
        field: &'static str,
        /// Raw text found at the field's offsets.
        found: String,
    },

    /// The declared data length does not fit the frame layout.
    #[error("invalid data length {0} (expected 255..=1006)")]
    InvalidDataLength(usize),

    /// Transaction id or payload bytes were not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A value cannot be represented in its fixed-width field.
    #[error("{field} out of range: {value} (max {max})")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: usize,
        /// Largest value the field can carry.
        max: usize,
    },

    /// The stream ended before the bytes the header declares arrived.
    #[error("truncated frame: header declares {declared} bytes, received {received}")]
    Truncated {
        /// Header plus declared data length.
        declared: usize,
        /// Bytes actually read.
        received: usize,
    },

    /// Read or write on the byte stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The listening endpoint or a connection's streams could not be prepared.
    #[error("setup failed: {context}: {source}")]
    Setup {
        /// What was being set up.
        context: &'static str,
        /// Underlying cause.
        source: std::io::Error,
    },

    /// The worker driving the connection was asked to stop.
    #[error("operation cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Stable numeric code handed to listeners alongside the message.
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::MalformedField { .. } => -2001,
            ProtocolError::InvalidDataLength(_) => -2002,
            ProtocolError::InvalidUtf8(_) => -2003,
            ProtocolError::OutOfRange { .. } => -2004,
            ProtocolError::Truncated { .. } => -2005,
            ProtocolError::Transport(_) => -3001,
            ProtocolError::Setup { .. } => -1001,
            ProtocolError::Cancelled => -4001,
        }
    }

    /// True for errors caused by bytes that violate the frame layout.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedField { .. }
                | ProtocolError::InvalidDataLength(_)
                | ProtocolError::InvalidUtf8(_)
                | ProtocolError::OutOfRange { .. }
                | ProtocolError::Truncated { .. }
        )
    }

    pub(crate) fn setup(context: &'static str, source: std::io::Error) -> Self {
        ProtocolError::Setup { context, source }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_classification() {
        let err = ProtocolError::MalformedField {
            field: "service",
            found: "0x1".to_string(),
        };
        assert!(err.is_framing());
        assert_eq!(err.code(), -2001);
        assert_eq!(err.to_string(), "malformed service field: \"0x1\"");

        let err = ProtocolError::Truncated {
            declared: 718,
            received: 600,
        };
        assert!(err.is_framing());
        assert_eq!(err.code(), -2005);

        let err = ProtocolError::Transport(std::io::Error::other("boom"));
        assert!(!err.is_framing());
        assert_eq!(err.code(), -3001);
    }

    #[test]
    fn test_setup_message() {
        let err = ProtocolError::setup(
            "bind listener",
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        );
        assert_eq!(err.to_string(), "setup failed: bind listener: in use");
        assert!(!ProtocolError::Cancelled.is_framing());
    }
}
