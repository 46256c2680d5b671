//! Logical transfer messages and their split into frame-sized chunks.

use crate::protocol::frame::{floor_boundary, Format, Service, MAX_CHUNK_LEN};

/// One logical message exchanged over a connection.
///
/// The payload may be any length; [`TransferMessage::chunks`] splits it into
/// pieces that each fit a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMessage {
    pub err_no: u16,
    pub tid: String,
    pub service: Service,
    pub format: Format,
    pub payload: String,
}

impl TransferMessage {
    pub fn new(
        err_no: u16,
        tid: impl Into<String>,
        service: Service,
        format: Format,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            err_no,
            tid: tid.into(),
            service,
            format,
            payload: payload.into(),
        }
    }

    /// An XML message with error number 0.
    pub fn xml(tid: impl Into<String>, service: Service, payload: impl Into<String>) -> Self {
        Self::new(0, tid, service, Format::Xml, payload)
    }

    /// Split the payload into `(service, chunk)` pairs in send order.
    ///
    /// Every chunk but the last is flagged [`Service::More`]; the last keeps
    /// the message's own service. Chunks never split a UTF-8 character, and
    /// an empty payload still yields one (empty) chunk.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            rest: &self.payload,
            service: self.service,
            done: false,
        }
    }
}

/// Iterator returned by [`TransferMessage::chunks`].
pub struct Chunks<'a> {
    rest: &'a str,
    service: Service,
    done: bool,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = (Service, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.rest.len() <= MAX_CHUNK_LEN {
            self.done = true;
            return Some((self.service, self.rest));
        }
        let head = floor_boundary(self.rest, MAX_CHUNK_LEN);
        self.rest = &self.rest[head.len()..];
        Some((Service::More, head))
    }
}
