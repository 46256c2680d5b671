//! Test doubles: an in-memory stream for exercising connections without
//! sockets, and a listener that records its callbacks.

use crate::error::ProtocolError;
use crate::listener::{Listener, SocketEvent};
use crate::protocol::{encode, Format, Service};
use crate::runtime::ByteStream;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

enum Step {
    Data(Vec<u8>),
    Error(io::ErrorKind),
}

/// Plays back scripted reads and captures writes.
///
/// Once the script is exhausted every read returns `Ok(0)`, like a peer
/// that has closed its end.
pub struct ScriptedStream {
    steps: VecDeque<Step>,
    written: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
    broken_writes: bool,
}

impl ScriptedStream {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            broken_writes: false,
        }
    }

    pub fn read(mut self, bytes: Vec<u8>) -> Self {
        self.steps.push_back(Step::Data(bytes));
        self
    }

    pub fn timeout(mut self) -> Self {
        self.steps.push_back(Step::Error(io::ErrorKind::WouldBlock));
        self
    }

    pub fn fail(mut self, kind: io::ErrorKind) -> Self {
        self.steps.push_back(Step::Error(kind));
        self
    }

    pub fn broken_writes(mut self) -> Self {
        self.broken_writes = true;
        self
    }

    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }

    pub fn shutdowns(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.shutdowns)
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            None => Ok(0),
            Some(Step::Error(kind)) => Err(io::Error::new(kind, "scripted")),
            Some(Step::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.steps.push_front(Step::Data(bytes.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted"));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for ScriptedStream {
    fn shutdown(&self) -> io::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Encode a single XML frame with error number 0.
pub fn frame_bytes(tid: &str, service: Service, payload: &str) -> Vec<u8> {
    encode(0, tid, service, Format::Xml, payload).unwrap().to_vec()
}

/// Listener that records every callback and answers from its fields.
pub struct RecordingListener {
    consume: bool,
    response: Option<String>,
    grant_shutdown: bool,
    received: Mutex<Vec<(String, String)>>,
    responded: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<(String, i32)>>,
    shutdown_requests: Mutex<Vec<String>>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self {
            consume: true,
            response: None,
            grant_shutdown: false,
            received: Mutex::new(Vec::new()),
            responded: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            shutdown_requests: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingListener {
    /// Report every delivered message as not consumed.
    pub fn refusing_consume() -> Self {
        Self {
            consume: false,
            ..Self::default()
        }
    }

    /// Answer `CONSUME_RESPOND` with `response`.
    pub fn responding(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            ..Self::default()
        }
    }

    /// Grant every shutdown request.
    pub fn granting_shutdown() -> Self {
        Self {
            grant_shutdown: true,
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<(String, String)> {
        self.received.lock().unwrap().clone()
    }

    pub fn responded(&self) -> Vec<(String, String)> {
        self.responded.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(String, i32)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn shutdown_requests(&self) -> Vec<String> {
        self.shutdown_requests.lock().unwrap().clone()
    }
}

impl Listener for RecordingListener {
    fn message_received(&self, event: &SocketEvent) -> bool {
        let message = event.message.clone().unwrap_or_default();
        self.received.lock().unwrap().push((event.tid.clone(), message));
        self.consume
    }

    fn message_received_and_want_response(&self, event: &SocketEvent) -> Option<String> {
        let message = event.message.clone().unwrap_or_default();
        self.responded
            .lock()
            .unwrap()
            .push((event.tid.clone(), message));
        self.response.clone()
    }

    fn handle_error(&self, event: &SocketEvent, error: &ProtocolError) {
        self.errors
            .lock()
            .unwrap()
            .push((event.tid.clone(), error.code()));
    }

    fn can_close_server_socket(&self, event: &SocketEvent) -> bool {
        self.shutdown_requests
            .lock()
            .unwrap()
            .push(event.tid.clone());
        self.grant_shutdown
    }
}
