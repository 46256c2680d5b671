//! Blocking connection runtime.
//!
//! Each accepted socket becomes a [`Connection`] driven by a
//! [`ConnectionHandler`] on one [`WorkerPool`] thread. Handlers observe a
//! [`CancelToken`] so the pool can stop them between reads.

mod cancel;
mod connection;
mod handler;
mod pool;
mod shelf;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancelToken;
pub use connection::{ByteStream, Connection, Role, READ_ATTEMPTS};
pub use handler::{ConnectionHandler, HandlerState};
pub use pool::{PoolClosed, WorkerPool};
pub use shelf::Shelf;
