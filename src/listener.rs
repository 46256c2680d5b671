//! Callbacks an application implements to receive messages.
//!
//! The server never owns application logic; each connection handler calls
//! into a shared [`Listener`] when a complete message arrives, when a peer
//! asks for shutdown, or when the connection fails.

use crate::error::ProtocolError;

/// TID reported when a failure happens before any frame was read.
pub const UNKNOWN_TID: &str = "Unknown TID";

/// TID reported for failures of the accept loop itself.
pub const TID_UNAVAILABLE: &str = "TID Unavailable";

/// What a listener callback is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Transaction id the event relates to.
    pub tid: String,
    /// Port the server is listening on.
    pub port: u16,
    /// Complete reassembled message, for delivery callbacks.
    pub message: Option<String>,
}

impl SocketEvent {
    pub fn new(tid: impl Into<String>, port: u16) -> Self {
        Self {
            tid: tid.into(),
            port,
            message: None,
        }
    }

    pub fn with_message(tid: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Self {
            tid: tid.into(),
            port,
            message: Some(message.into()),
        }
    }
}

/// Application side of the protocol.
///
/// Called from connection worker threads, possibly several at once.
pub trait Listener: Send + Sync {
    /// A complete message arrived with `CONSUME`.
    ///
    /// Return `true` if the application consumed it; the peer is told either
    /// way.
    fn message_received(&self, event: &SocketEvent) -> bool;

    /// A complete message arrived with `CONSUME_RESPOND`.
    ///
    /// A returned string is sent back to the peer as a further `CONSUME`
    /// message.
    fn message_received_and_want_response(&self, event: &SocketEvent) -> Option<String>;

    /// The connection failed with a framing or transport error.
    fn handle_error(&self, event: &SocketEvent, error: &ProtocolError);

    /// A peer asked for the whole server to shut down.
    fn can_close_server_socket(&self, event: &SocketEvent) -> bool;

    /// Reserved; not consulted by the dispatch loop.
    fn consume_message(&self) -> bool {
        true
    }
}
