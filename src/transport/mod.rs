//! The framed channel transport.
//!
//! A [`Transport`] shuttles protocol frames over any reliable byte stream: a
//! socket pair, a pipe to a spawned peer, or the inside of a TLS or
//! WebSocket connection. Inbound bytes become [`TransportEvent`]s; outbound
//! messages are queued with [`Transport::send`] or through a cloned
//! [`TransportHandle`] and flushed whenever the transport is polled.
//!
//! Messages for a frozen channel are buffered and redelivered, in arrival
//! order, when the channel thaws. This is what lets a channel finish its
//! asynchronous preparation before it sees any input.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::error::Problem;

pub mod codec;
mod pipe;

pub use self::codec::{parse_command, ControlMessage, Frame, FrameCodec};
pub use self::pipe::PipeTransport;

const READ_CHUNK: usize = 8 * 1024;

/// Something that happened on a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A data payload arrived for a channel.
    Recv {
        /// The channel the payload is addressed to.
        channel: String,
        /// The payload bytes.
        payload: Bytes,
    },
    /// A control message arrived.
    Control {
        /// The validated command.
        command: String,
        /// The channel the command concerns, if any.
        channel: Option<String>,
        /// The full control message object.
        options: Map<String, Value>,
        /// The raw payload, for relaying without re-serialization.
        raw: Bytes,
    },
    /// The transport closed. This is the final event.
    Closed {
        /// Why the transport closed; `None` for an orderly end of stream.
        problem: Option<Problem>,
    },
}

enum Command {
    Send {
        channel: Option<String>,
        payload: Bytes,
    },
    Freeze(String),
    Thaw(String),
    Close(Option<Problem>),
}

/// A clonable sender side of a [`Transport`].
///
/// Channels hold one of these to queue outgoing messages and to control
/// freezing without owning the transport itself. Queued work is picked up
/// the next time the transport is polled.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl TransportHandle {
    /// Queues a payload for a channel, or a control payload when `channel`
    /// is `None`.
    pub fn send(&self, channel: Option<&str>, payload: Bytes) {
        let _ = self.tx.send(Command::Send {
            channel: channel.map(str::to_owned),
            payload,
        });
    }

    /// Queues a control message.
    pub fn control(&self, options: &Map<String, Value>) {
        let payload = serde_json::to_vec(&Value::Object(options.clone()))
            .expect("control message serializes");
        self.send(None, payload.into());
    }

    /// Starts buffering inbound messages for a channel.
    pub fn freeze(&self, channel: &str) {
        let _ = self.tx.send(Command::Freeze(channel.to_owned()));
    }

    /// Stops buffering for a channel and redelivers what was held back.
    pub fn thaw(&self, channel: &str) {
        let _ = self.tx.send(Command::Thaw(channel.to_owned()));
    }

    /// Shuts the transport down.
    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.tx.send(Command::Close(problem));
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").finish()
    }
}

struct FrozenEvent {
    channel: String,
    event: TransportEvent,
}

/// A framed message transport over a byte stream.
pub struct Transport<T> {
    io: T,
    name: String,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    freeze: HashSet<String>,
    frozen: VecDeque<FrozenEvent>,
    pending: VecDeque<TransportEvent>,
    read_done: bool,
    closing: Option<Option<Problem>>,
    emitted_closed: bool,
}

impl<T> Transport<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a transport over `io`. The `name` shows up in log output.
    pub fn new(io: T, name: &str) -> Transport<T> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Transport {
            io,
            name: name.to_owned(),
            codec: FrameCodec::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            cmd_tx,
            cmd_rx,
            freeze: HashSet::new(),
            frozen: VecDeque::new(),
            pending: VecDeque::new(),
            read_done: false,
            closing: None,
            emitted_closed: false,
        }
    }

    /// A clonable handle for queueing messages from elsewhere.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// The transport's log name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a payload for a channel, or a control payload when `channel`
    /// is `None`. Messages queued after close are dropped.
    pub fn send(&mut self, channel: Option<&str>, payload: Bytes) {
        if self.closing.is_some() || self.emitted_closed {
            debug!("{}: dropping message on closed transport", self.name);
            return;
        }
        let size = payload.len();
        let frame = Frame {
            channel: channel.map(str::to_owned),
            payload,
        };
        self.codec
            .encode(frame, &mut self.write_buf)
            .expect("frame encoding is infallible");
        trace!("{}: queued {} byte payload", self.name, size);
    }

    /// Builds and queues a control message.
    pub fn control(&mut self, options: &Map<String, Value>) {
        let payload = serde_json::to_vec(&Value::Object(options.clone()))
            .expect("control message serializes");
        self.send(None, payload.into());
    }

    /// Starts buffering inbound messages addressed to `channel`.
    pub fn freeze(&mut self, channel: &str) {
        self.freeze.insert(channel.to_owned());
    }

    /// Stops buffering for `channel`, redelivering held messages in order.
    pub fn thaw(&mut self, channel: &str) {
        if !self.freeze.remove(channel) {
            return;
        }
        let mut kept = VecDeque::with_capacity(self.frozen.len());
        for frozen in self.frozen.drain(..) {
            if frozen.channel == channel {
                self.pending.push_back(frozen.event);
            } else {
                kept.push_back(frozen);
            }
        }
        self.frozen = kept;
    }

    /// Closes the transport. A final [`TransportEvent::Closed`] with the
    /// given problem is delivered, then the stream is shut down.
    pub fn close(&mut self, problem: Option<Problem>) {
        if self.closing.is_none() && !self.emitted_closed {
            self.closing = Some(problem);
        }
    }

    /// Flushes queued output without delivering events.
    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        self.drain_commands();
        match self.poll_write_buf(cx) {
            Poll::Ready(Ok(())) if self.write_buf.is_empty() => Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Err(crate::Error::new_io(err))),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Drives the transport, resolving with the next event. After the
    /// `Closed` event this resolves with `None` forever.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransportEvent>> {
        loop {
            self.poll_commands(cx);

            if let Poll::Ready(Err(err)) = self.poll_write_buf(cx) {
                warn!("{}: transport write failed: {}", self.name, err);
                self.close(Some(io_problem(&err)));
            }

            if let Some(problem) = self.take_close(cx) {
                return Poll::Ready(Some(TransportEvent::Closed { problem }));
            }
            if self.emitted_closed {
                return Poll::Ready(None);
            }

            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }

            match self.next_frame() {
                NextFrame::Event(event) => return Poll::Ready(Some(event)),
                NextFrame::Again => continue,
                NextFrame::NeedRead => (),
            }

            if self.read_done {
                // The residue of a partial frame means the peer vanished
                // mid-message.
                let problem = if !self.read_buf.is_empty() {
                    debug!(
                        "{}: received truncated {} byte frame",
                        self.name,
                        self.read_buf.len()
                    );
                    Some(Problem::Disconnected)
                } else {
                    None
                };
                self.close(problem);
                continue;
            }

            match self.poll_read(cx) {
                Poll::Ready(Ok(0)) => {
                    self.read_done = true;
                }
                Poll::Ready(Ok(_)) => (),
                Poll::Ready(Err(err)) => {
                    debug!("{}: transport read failed: {}", self.name, err);
                    self.close(Some(io_problem(&err)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_commands(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(cmd)) = self.cmd_rx.poll_recv(cx) {
            self.apply_command(cmd);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.apply_command(cmd);
        }
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { channel, payload } => self.send(channel.as_deref(), payload),
            Command::Freeze(channel) => self.freeze(&channel),
            Command::Thaw(channel) => self.thaw(&channel),
            Command::Close(problem) => self.close(problem),
        }
    }

    fn take_close(&mut self, cx: &mut Context<'_>) -> Option<Option<Problem>> {
        let problem = self.closing.take()?;
        self.emitted_closed = true;
        self.pending.clear();
        self.frozen.clear();
        // Best effort shutdown; the stream is going away either way.
        let _ = Pin::new(&mut self.io).poll_shutdown(cx);
        debug!(
            "{}: closed{}{}",
            self.name,
            if problem.is_some() { ": " } else { "" },
            problem.as_ref().map(Problem::as_str).unwrap_or("")
        );
        Some(problem)
    }

    fn next_frame(&mut self) -> NextFrame {
        let frame = match self.codec.decode(&mut self.read_buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return NextFrame::NeedRead,
            Err(_) => {
                warn!(
                    "{}: incorrect protocol: received invalid length prefix",
                    self.name
                );
                self.close(Some(Problem::ProtocolError));
                return NextFrame::Again;
            }
        };

        match frame.channel {
            Some(channel) => {
                trace!(
                    "{}: received a {} byte payload for {}",
                    self.name,
                    frame.payload.len(),
                    channel
                );
                let event = TransportEvent::Recv {
                    channel: channel.clone(),
                    payload: frame.payload,
                };
                self.deliver(Some(channel), event)
            }
            None => {
                let message = match parse_command(&frame.payload) {
                    Ok(message) => message,
                    Err(_) => {
                        self.close(Some(Problem::ProtocolError));
                        return NextFrame::Again;
                    }
                };

                if message.channel.is_none() {
                    // Single-hop flow control is answered right here.
                    if message.command == "ping" {
                        let mut pong = message.options;
                        pong.insert("command".into(), Value::String("pong".into()));
                        self.control(&pong);
                        return NextFrame::Again;
                    } else if message.command == "pong" {
                        return NextFrame::Again;
                    }
                }

                let event = TransportEvent::Control {
                    command: message.command,
                    channel: message.channel.clone(),
                    options: message.options,
                    raw: frame.payload,
                };
                self.deliver(message.channel, event)
            }
        }
    }

    fn deliver(&mut self, channel: Option<String>, event: TransportEvent) -> NextFrame {
        if let Some(channel) = channel {
            if self.freeze.contains(&channel) {
                self.frozen.push_back(FrozenEvent { channel, event });
                return NextFrame::Again;
            }
        }
        NextFrame::Event(event)
    }

    fn poll_write_buf(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        let _ = Pin::new(&mut self.io).poll_flush(cx);
        Poll::Ready(Ok(()))
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        self.read_buf.reserve(READ_CHUNK);
        tokio_util::io::poll_read_buf(Pin::new(&mut self.io), cx, &mut self.read_buf)
    }
}

impl<T> std::fmt::Debug for Transport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("frozen", &self.frozen.len())
            .field("closed", &self.emitted_closed)
            .finish()
    }
}

enum NextFrame {
    Event(TransportEvent),
    Again,
    NeedRead,
}

/// Maps a stream error to the problem code reported to consumers.
pub(crate) fn io_problem(err: &std::io::Error) -> Problem {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => Problem::NotFound,
        ErrorKind::PermissionDenied => Problem::AccessDenied,
        ErrorKind::ConnectionRefused => Problem::Other("connection-refused".into()),
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            Problem::Disconnected
        }
        _ => Problem::InternalError,
    }
}
