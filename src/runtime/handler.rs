//! Per-connection request/response state machine.
//!
//! A handler owns one [`Connection`] and runs on a pool worker until the
//! peer closes, the connection fails, the worker is cancelled, or a granted
//! `SHUTDOWN` takes the whole server down.

use crate::error::{ProtocolError, Result};
use crate::listener::{Listener, SocketEvent, UNKNOWN_TID};
use crate::protocol::{Format, Frame, Service, TransferMessage};
use crate::runtime::{ByteStream, CancelToken, Connection};
use crate::server::ServerHandle;
use std::net::TcpStream;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const READY_PAYLOAD: &str = "Server Ready";
const MORE_PAYLOAD: &str = "Message part saved. Awaiting more";
const DISCARD_PAYLOAD: &str = "Message discarded";

/// Lifecycle of a connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Receiving and dispatching frames.
    Running,
    /// Peer closed, connection failed, or worker cancelled.
    ClosingConnection,
    /// A granted `SHUTDOWN`; the server is told to stop after the connection closes.
    ClosingServer,
    /// Connection closed; terminal.
    Closed,
}

/// Drives one accepted connection.
pub struct ConnectionHandler<S: ByteStream = TcpStream> {
    connection: Connection<S>,
    listener: Arc<dyn Listener>,
    port: u16,
    server: Option<ServerHandle>,
    state: HandlerState,
}

impl<S: ByteStream> ConnectionHandler<S> {
    pub fn new(connection: Connection<S>, listener: Arc<dyn Listener>, port: u16) -> Self {
        Self {
            connection,
            listener,
            port,
            server: None,
            state: HandlerState::Running,
        }
    }

    /// Server to notify when a peer's `SHUTDOWN` is granted.
    pub fn with_server(mut self, server: ServerHandle) -> Self {
        self.server = Some(server);
        self
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.connection.cancel_token().clone()
    }

    /// Run the receive/dispatch loop to completion.
    ///
    /// Returns the closing state that ended the loop; the handler itself is
    /// [`HandlerState::Closed`] afterwards.
    pub fn run(&mut self) -> HandlerState {
        let exit = match self.accept_messages() {
            Ok(state) => state,
            Err(ProtocolError::Cancelled) => {
                info!(peer = ?self.connection.peer_addr(), "Connection worker cancelled");
                HandlerState::ClosingConnection
            }
            Err(err) => {
                let tid = self
                    .connection
                    .last_tid()
                    .filter(|tid| !tid.is_empty())
                    .unwrap_or(UNKNOWN_TID)
                    .to_string();
                warn!(peer = ?self.connection.peer_addr(), tid = %tid, error = %err, "Connection failed");
                self.listener
                    .handle_error(&SocketEvent::new(tid, self.port), &err);
                HandlerState::ClosingConnection
            }
        };

        self.connection.close();
        self.state = HandlerState::Closed;

        if exit == HandlerState::ClosingServer {
            if let Some(server) = &self.server {
                server.terminate_processing();
            }
        }
        exit
    }

    fn accept_messages(&mut self) -> Result<HandlerState> {
        info!(peer = ?self.connection.peer_addr(), "Connection accepted, sending READY");
        self.connection
            .send_message(&TransferMessage::xml("", Service::Ready, READY_PAYLOAD))?;

        while self.state == HandlerState::Running {
            let frame = self.connection.receive_frame()?;
            self.state = self.dispatch(frame)?;

            if self.state == HandlerState::Running && self.connection.is_cancelled() {
                info!("Cancellation observed, closing connection");
                self.state = HandlerState::ClosingConnection;
            }
        }
        Ok(self.state)
    }

    fn dispatch(&mut self, frame: Frame) -> Result<HandlerState> {
        if frame.is_severed() {
            return Ok(HandlerState::ClosingConnection);
        }

        match (frame.service, frame.format) {
            (Service::Close, _) => {
                info!(tid = %frame.tid, "Request to CLOSE connection received");
                Ok(HandlerState::ClosingConnection)
            }
            (Service::Shutdown, _) => {
                info!(tid = %frame.tid, "Request to SHUTDOWN received");
                let event = SocketEvent::new(frame.tid.as_str(), self.port);
                if self.listener.can_close_server_socket(&event) {
                    info!(tid = %frame.tid, "Application granted SHUTDOWN");
                    Ok(HandlerState::ClosingServer)
                } else {
                    info!(tid = %frame.tid, "Application refused SHUTDOWN, closing this connection only");
                    Ok(HandlerState::ClosingConnection)
                }
            }
            (Service::More, Format::Xml) => {
                debug!(tid = %frame.tid, "Chunk saved, acknowledging MORE");
                self.connection
                    .send_message(&TransferMessage::xml(&frame.tid, Service::More, MORE_PAYLOAD))?;
                Ok(HandlerState::Running)
            }
            (Service::Discard, Format::Xml) => {
                self.connection.discard_message(&frame.tid);
                self.connection.send_message(&TransferMessage::xml(
                    &frame.tid,
                    Service::Discard,
                    DISCARD_PAYLOAD,
                ))?;
                Ok(HandlerState::Running)
            }
            (Service::Consume, Format::Xml) => {
                self.consume(frame)?;
                Ok(HandlerState::Running)
            }
            (Service::ConsumeRespond, Format::Xml) => {
                self.consume_and_respond(frame)?;
                Ok(HandlerState::Running)
            }
            (service, format) => {
                trace!(tid = %frame.tid, ?service, ?format, "Ignoring frame");
                Ok(HandlerState::Running)
            }
        }
    }

    /// Deliver a complete message and report whether it was consumed.
    fn consume(&mut self, frame: Frame) -> Result<()> {
        let payload = self.complete_message(&frame);
        let event = SocketEvent::with_message(frame.tid.as_str(), self.port, payload);
        let consumed = self.listener.message_received(&event);

        let reply = if consumed {
            "Message consumed"
        } else {
            "Message not consumed"
        };
        let err_no = if consumed { 0 } else { 1 };
        self.connection.send_message(&TransferMessage::new(
            err_no,
            &frame.tid,
            Service::Consume,
            Format::Xml,
            reply,
        ))?;
        debug!(tid = %frame.tid, consumed, "CONSUME answered");
        Ok(())
    }

    /// Acknowledge receipt, then send back whatever the application answers.
    fn consume_and_respond(&mut self, frame: Frame) -> Result<()> {
        let payload = self.complete_message(&frame);
        self.connection.send_message(&TransferMessage::xml(
            &frame.tid,
            Service::Consume,
            "Message consumed",
        ))?;

        let event = SocketEvent::with_message(frame.tid.as_str(), self.port, payload);
        if let Some(response) = self.listener.message_received_and_want_response(&event) {
            self.connection
                .send_message(&TransferMessage::xml(&frame.tid, Service::Consume, response))?;
            debug!(tid = %frame.tid, "Response returned to peer");
        }
        Ok(())
    }

    /// Take the reassembled payload off the shelf.
    ///
    /// A frame without a transaction id is never shelved and carries its
    /// whole message itself.
    fn complete_message(&mut self, frame: &Frame) -> String {
        if frame.tid.is_empty() {
            return frame.payload.clone();
        }
        self.connection.take_message(&frame.tid).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, FRAME_SIZE};
    use crate::runtime::testing::{frame_bytes, RecordingListener, ScriptedStream};
    use crate::runtime::Role;
    use std::io;

    fn run_script(
        stream: ScriptedStream,
        listener: Arc<RecordingListener>,
    ) -> (HandlerState, Vec<Frame>) {
        let written = stream.written();
        let conn = Connection::new(stream, Role::Server, CancelToken::new());
        let mut handler = ConnectionHandler::new(conn, listener, 11819);
        let exit = handler.run();
        assert_eq!(handler.state(), HandlerState::Closed);

        let bytes = written.lock().unwrap().clone();
        let frames = bytes
            .chunks(FRAME_SIZE)
            .map(|c| decode(c.try_into().unwrap()).unwrap())
            .collect();
        (exit, frames)
    }

    #[test]
    fn test_ready_then_close() {
        let stream = ScriptedStream::new().read(frame_bytes("", Service::Close, ""));
        let (exit, frames) = run_script(stream, Arc::new(RecordingListener::default()));

        assert_eq!(exit, HandlerState::ClosingConnection);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].service, Service::Ready);
        assert_eq!(frames[0].tid, "");
        assert_eq!(frames[0].format, Format::Xml);
    }

    #[test]
    fn test_severed_closes_without_error() {
        let listener = Arc::new(RecordingListener::default());
        let (exit, _) = run_script(ScriptedStream::new(), Arc::clone(&listener));

        assert_eq!(exit, HandlerState::ClosingConnection);
        assert!(listener.errors().is_empty());
    }

    #[test]
    fn test_consume_delivers_and_acknowledges() {
        let listener = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new()
            .read(frame_bytes("1", Service::Consume, "<A/>"))
            .read(frame_bytes("", Service::Close, ""));
        let (_, frames) = run_script(stream, Arc::clone(&listener));

        assert_eq!(listener.received(), vec![("1".to_string(), "<A/>".to_string())]);
        assert_eq!(frames[1].service, Service::Consume);
        assert_eq!(frames[1].err_no, 0);
        assert_eq!(frames[1].tid, "1");
    }

    #[test]
    fn test_consume_refused_reports_errno_one() {
        let listener = Arc::new(RecordingListener::refusing_consume());
        let stream = ScriptedStream::new().read(frame_bytes("5", Service::Consume, "<X/>"));
        let (_, frames) = run_script(stream, listener);

        assert_eq!(frames[1].err_no, 1);
        assert_eq!(frames[1].payload, "Message not consumed");
    }

    #[test]
    fn test_consume_respond_sends_receipt_then_response() {
        let listener = Arc::new(RecordingListener::responding("<REPLY/>"));
        let stream = ScriptedStream::new().read(frame_bytes("2", Service::ConsumeRespond, "<B/>"));
        let (_, frames) = run_script(stream, Arc::clone(&listener));

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].service, Service::Consume);
        assert_eq!(frames[1].err_no, 0);
        assert_eq!(frames[2].service, Service::Consume);
        assert_eq!(frames[2].payload, "<REPLY/>");
        assert_eq!(listener.responded(), vec![("2".to_string(), "<B/>".to_string())]);
    }

    #[test]
    fn test_consume_respond_without_response() {
        let stream = ScriptedStream::new().read(frame_bytes("2", Service::ConsumeRespond, "<B/>"));
        let (_, frames) = run_script(stream, Arc::new(RecordingListener::default()));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_chunked_message_reassembled() {
        let listener = Arc::new(RecordingListener::default());
        let head = "a".repeat(751);
        let middle = "b".repeat(751);
        let tail = "c".repeat(98);
        let stream = ScriptedStream::new()
            .read(frame_bytes("3", Service::More, &head))
            .read(frame_bytes("3", Service::More, &middle))
            .read(frame_bytes("3", Service::Consume, &tail));
        let (_, frames) = run_script(stream, Arc::clone(&listener));

        // READY, two MORE acks, CONSUME answer
        let services: Vec<Service> = frames.iter().map(|f| f.service).collect();
        assert_eq!(
            services,
            vec![Service::Ready, Service::More, Service::More, Service::Consume]
        );

        let received = listener.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, format!("{head}{middle}{tail}"));
        assert_eq!(received[0].1.len(), 1600);
    }

    #[test]
    fn test_discard_drops_partial_message() {
        let listener = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new()
            .read(frame_bytes("4", Service::More, "stale"))
            .read(frame_bytes("4", Service::Discard, ""))
            .read(frame_bytes("4", Service::Consume, "fresh"));
        let (_, frames) = run_script(stream, Arc::clone(&listener));

        assert_eq!(frames[2].service, Service::Discard);
        assert_eq!(frames[2].payload, "Message discarded");
        assert_eq!(listener.received(), vec![("4".to_string(), "fresh".to_string())]);
    }

    #[test]
    fn test_interleaved_transactions_stay_separate() {
        let listener = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new()
            .read(frame_bytes("x", Service::More, "x1-"))
            .read(frame_bytes("y", Service::More, "y1-"))
            .read(frame_bytes("x", Service::Consume, "x2"))
            .read(frame_bytes("y", Service::Consume, "y2"));
        run_script(stream, Arc::clone(&listener));

        assert_eq!(
            listener.received(),
            vec![
                ("x".to_string(), "x1-x2".to_string()),
                ("y".to_string(), "y1-y2".to_string()),
            ]
        );
    }

    #[test]
    fn test_shutdown_granted_and_refused() {
        let granted = Arc::new(RecordingListener::granting_shutdown());
        let stream = ScriptedStream::new().read(frame_bytes("4", Service::Shutdown, ""));
        let (exit, _) = run_script(stream, Arc::clone(&granted));
        assert_eq!(exit, HandlerState::ClosingServer);
        assert_eq!(granted.shutdown_requests(), vec!["4".to_string()]);

        let refused = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new().read(frame_bytes("4", Service::Shutdown, ""));
        let (exit, _) = run_script(stream, refused);
        assert_eq!(exit, HandlerState::ClosingConnection);
    }

    #[test]
    fn test_unhandled_services_are_ignored() {
        let listener = Arc::new(RecordingListener::default());
        let refuse = frame_bytes("9", Service::Refuse, "r");
        // Unrecognised format on an otherwise valid CONSUME
        let mut odd_format = frame_bytes("8", Service::Consume, "o");
        odd_format[8..11].copy_from_slice(b"000");
        let stream = ScriptedStream::new()
            .read(refuse)
            .read(odd_format)
            .read(frame_bytes("", Service::Ready, ""))
            .read(frame_bytes("", Service::Close, ""));
        let (exit, frames) = run_script(stream, Arc::clone(&listener));

        assert_eq!(exit, HandlerState::ClosingConnection);
        assert_eq!(frames.len(), 1);
        assert!(listener.received().is_empty());
    }

    #[test]
    fn test_framing_error_reported_with_last_tid() {
        let listener = Arc::new(RecordingListener::default());
        let mut bad = frame_bytes("6", Service::Consume, "x");
        bad[12..17].copy_from_slice(b"abcde");
        let stream = ScriptedStream::new()
            .read(frame_bytes("6", Service::More, "part"))
            .read(bad);
        let (exit, _) = run_script(stream, Arc::clone(&listener));

        assert_eq!(exit, HandlerState::ClosingConnection);
        let errors = listener.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "6");
        assert_eq!(errors[0].1, -2001);
    }

    #[test]
    fn test_transport_error_before_any_frame() {
        let listener = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new().fail(io::ErrorKind::ConnectionReset);
        run_script(stream, Arc::clone(&listener));

        let errors = listener.errors();
        assert_eq!(errors, vec![(UNKNOWN_TID.to_string(), -3001)]);
    }

    #[test]
    fn test_empty_last_tid_reported_as_unknown() {
        let listener = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new()
            .read(frame_bytes("", Service::Ready, ""))
            .fail(io::ErrorKind::ConnectionReset);
        run_script(stream, Arc::clone(&listener));

        assert_eq!(listener.errors(), vec![(UNKNOWN_TID.to_string(), -3001)]);
    }

    #[test]
    fn test_truncated_consume_is_not_delivered() {
        let listener = Arc::new(RecordingListener::default());
        let cut = frame_bytes("1", Service::Consume, &"q".repeat(700));
        let stream = ScriptedStream::new()
            .read(frame_bytes("1", Service::More, "head"))
            .read(cut[..600].to_vec());
        let (exit, _) = run_script(stream, Arc::clone(&listener));

        assert_eq!(exit, HandlerState::ClosingConnection);
        assert!(listener.received().is_empty());
        assert_eq!(listener.errors(), vec![("1".to_string(), -2005)]);
    }

    #[test]
    fn test_cancelled_handler_closes_quietly() {
        let listener = Arc::new(RecordingListener::default());
        let stream = ScriptedStream::new().read(frame_bytes("1", Service::More, "x"));
        let cancel = CancelToken::new();
        let conn = Connection::new(stream, Role::Server, cancel.clone());
        let mut handler = ConnectionHandler::new(conn, Arc::clone(&listener) as Arc<dyn Listener>, 1);

        cancel.cancel();
        assert_eq!(handler.run(), HandlerState::ClosingConnection);
        assert!(listener.errors().is_empty());
    }
}
