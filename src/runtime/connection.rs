//! Blocking frame I/O over one byte stream.
//!
//! A `Connection` reads and writes whole frames, splits outgoing messages
//! into chunks, and reassembles incoming chunks on its shelf. It is driven
//! by exactly one thread for its whole life.

use crate::error::{ProtocolError, Result};
use crate::protocol::frame::HEADER_LEN;
use crate::protocol::{decode, encode, Frame, TransferMessage, FRAME_SIZE};
use crate::runtime::{CancelToken, Shelf};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Number of read calls allowed to assemble one frame.
///
/// Combined with the read timeout this bounds how long a silent peer is
/// waited for before the connection is presumed dead.
pub const READ_ATTEMPTS: usize = 6;

/// Which side of the conversation a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("SERVER"),
            Role::Client => f.write_str("CLIENT"),
        }
    }
}

/// A byte stream a [`Connection`] can drive.
pub trait ByteStream: Read + Write + Send {
    /// Close both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl ByteStream for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// One framed connection plus its reassembly shelf.
pub struct Connection<S: ByteStream = TcpStream> {
    stream: S,
    role: Role,
    peer: Option<SocketAddr>,
    shelf: Shelf,
    cancel: CancelToken,
    last_tid: Option<String>,
    closed: bool,
}

impl Connection<TcpStream> {
    /// Wrap a stream accepted by the server.
    pub fn accepted(
        stream: TcpStream,
        read_timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> Result<Self> {
        prepare_stream(&stream, read_timeout)?;
        Ok(Self::new(stream, Role::Server, cancel))
    }

    /// Open a client connection to a server.
    pub fn connect(addr: impl ToSocketAddrs, read_timeout: Option<Duration>) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).map_err(|e| ProtocolError::setup("connect to server", e))?;
        prepare_stream(&stream, read_timeout)?;
        Ok(Self::new(stream, Role::Client, CancelToken::new()))
    }
}

impl<S: ByteStream> Connection<S> {
    pub fn new(stream: S, role: Role, cancel: CancelToken) -> Self {
        let peer = stream.peer_addr();
        Self {
            stream,
            role,
            peer,
            shelf: Shelf::new(),
            cancel,
            last_tid: None,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Transaction id of the last frame received, if any.
    pub fn last_tid(&self) -> Option<&str> {
        self.last_tid.as_deref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn shelf(&self) -> &Shelf {
        &self.shelf
    }

    /// Block until one frame arrives.
    ///
    /// Up to [`READ_ATTEMPTS`] reads are made; bytes from each attempt
    /// accumulate. If nothing at all arrives the severed sentinel is
    /// returned instead of an error; a frame cut short of its declared
    /// length is [`ProtocolError::Truncated`]. Chunks carrying a transaction
    /// id are recorded on the shelf before the frame is handed back.
    pub fn receive_frame(&mut self) -> Result<Frame> {
        let mut raw = [0u8; FRAME_SIZE];
        let mut filled = 0;
        let mut attempts = 0;

        while filled < FRAME_SIZE && attempts < READ_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            attempts += 1;

            match self.stream.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    trace!(role = %self.role, attempts, filled, "Read returned without a full frame");
                }
                Err(e) => return Err(ProtocolError::Transport(e)),
            }
        }

        if filled == 0 {
            info!(role = %self.role, peer = ?self.peer, "No data received, assuming peer severed the connection");
            return Ok(Frame::severed());
        }
        if filled < FRAME_SIZE {
            debug!(role = %self.role, filled, attempts, "Decoding partial frame");
        }

        let frame = decode(&raw)?;
        if frame.is_severed() {
            info!(role = %self.role, peer = ?self.peer, "Received error 999, treating connection as severed");
            return Ok(frame);
        }

        let declared = HEADER_LEN + frame.data_length;
        if filled < declared {
            return Err(ProtocolError::Truncated {
                declared,
                received: filled,
            });
        }

        debug!(
            role = %self.role,
            tid = %frame.tid,
            service = ?frame.service,
            format = ?frame.format,
            data_length = frame.data_length,
            "Frame received"
        );

        if !frame.tid.is_empty() {
            self.record_chunk(&frame.tid, &frame.payload);
        }
        self.last_tid = Some(frame.tid.clone());
        Ok(frame)
    }

    /// Send a message, split over as many frames as it needs.
    pub fn send_message(&mut self, message: &TransferMessage) -> Result<()> {
        for (service, chunk) in message.chunks() {
            let frame = encode(message.err_no, &message.tid, service, message.format, chunk)?;
            self.write_frame(&frame)?;
            debug!(
                role = %self.role,
                tid = %message.tid,
                service = ?service,
                len = chunk.len(),
                "Frame sent"
            );
        }
        Ok(())
    }

    /// Append a chunk to the shelf entry for `tid`.
    pub fn record_chunk(&mut self, tid: &str, chunk: &str) {
        self.shelf.record(tid, chunk);
        trace!(role = %self.role, tid, len = chunk.len(), pending = self.shelf.len(), "Chunk shelved");
    }

    /// Remove and return the reassembled payload for `tid`.
    pub fn take_message(&mut self, tid: &str) -> Option<String> {
        self.shelf.take(tid)
    }

    /// Drop whatever has been received for `tid`.
    pub fn discard_message(&mut self, tid: &str) -> Option<String> {
        let discarded = self.shelf.take(tid);
        if let Some(ref payload) = discarded {
            debug!(role = %self.role, tid, len = payload.len(), "Discarded partial message");
        }
        discarded
    }

    /// Close the stream. Safe to call more than once; failures are only logged.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.stream.shutdown() {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!(role = %self.role, peer = ?self.peer, error = %e, "Failed to close connection");
            }
        }
        debug!(role = %self.role, peer = ?self.peer, "Connection closed");
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

fn prepare_stream(stream: &TcpStream, read_timeout: Option<Duration>) -> Result<()> {
    stream
        .set_read_timeout(read_timeout)
        .map_err(|e| ProtocolError::setup("set read timeout", e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| ProtocolError::setup("disable nagle", e))?;
    Ok(())
}
