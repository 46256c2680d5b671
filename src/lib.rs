//! txframe: framed XML transactions over TCP
//!
//! Peers exchange fixed 1024-byte frames, each carrying a transaction id and
//! one chunk of an XML message. Long messages span several frames and are
//! reassembled per transaction id before the application sees them.
//!
//! - [`protocol`]: the frame codec and outgoing message chunking
//! - [`runtime`]: blocking connections, per-connection handlers, worker pool
//! - [`server`]: accept loop and coordinated shutdown
//! - [`listener`]: callbacks the application implements

pub mod app;
pub mod config;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod shutdown_log;

pub use error::{ProtocolError, Result};
pub use listener::{Listener, SocketEvent};
pub use server::{Server, ServerHandle};
