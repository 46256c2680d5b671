//! Cooperative cancellation for connection workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set-once flag shared between a worker and whoever may stop it.
///
/// Workers check the token at every blocking read or write and wind down
/// through their normal closing path once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
