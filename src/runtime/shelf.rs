//! Per-connection store of partially received messages.

use std::collections::HashMap;

/// Maps a transaction id to the payload accumulated so far.
///
/// Owned by exactly one connection and only touched by the worker driving
/// it, so no synchronisation is needed.
#[derive(Debug, Default)]
pub struct Shelf {
    entries: HashMap<String, String>,
}

impl Shelf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the entry for `tid`, creating it if needed.
    pub fn record(&mut self, tid: &str, chunk: &str) {
        match self.entries.get_mut(tid) {
            Some(buffer) => buffer.push_str(chunk),
            None => {
                self.entries.insert(tid.to_string(), chunk.to_string());
            }
        }
    }

    /// Peek at the payload accumulated for `tid`.
    #[cfg(test)]
    pub(crate) fn get(&self, tid: &str) -> Option<&str> {
        self.entries.get(tid).map(String::as_str)
    }

    /// Remove and return the payload accumulated for `tid`.
    pub fn take(&mut self, tid: &str) -> Option<String> {
        self.entries.remove(tid)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, tid: &str) -> bool {
        self.entries.contains_key(tid)
    }

    /// Number of transactions in progress.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
