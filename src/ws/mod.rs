//! The WebSocket connection engine (RFC 6455).
//!
//! One [`WebSocket`] type serves both ends of the wire; construction as
//! [`WebSocket::client`] or [`WebSocket::server`] decides the handshake
//! behavior and whether outgoing frames are masked. The API follows the W3C
//! shape: drive the connection with [`WebSocket::poll_event`], send with
//! [`WebSocket::send`], and perform an orderly shutdown with
//! [`WebSocket::close`].
//!
//! The connection participates in the same back-pressure scheme as
//! channels: queued output crossing the high-water mark emits a pressure
//! edge, and a controlling upstream flow can pause the reading side.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Duration, Sleep};
use tracing::{debug, trace, warn};

use crate::error::{Error, Parse, Result};
use crate::flow::{pressure, PressureReceiver, PressureSender, Throttled};

mod frame;
mod handshake;

pub use self::frame::DataType;

use self::frame::{build_frame, opcode, parse_frame, InboundFrame, Parsed};

/// Close codes from RFC 6455 section 7.4.1.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// The peer violated the protocol.
    pub const PROTOCOL: u16 = 1002;
    /// A message violated the data type contract (e.g. non-UTF-8 text).
    pub const BAD_DATA: u16 = 1007;
    /// A message was too big to accept.
    pub const TOO_BIG: u16 = 1009;
}

/// The queue size above which back pressure is applied.
const QUEUE_PRESSURE: usize = 1024 * 1024;

/// How long to wait for the peer to close the stream after the close
/// handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

/// The observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The handshake has not completed yet.
    Connecting,
    /// Messages can flow.
    Open,
    /// A close was sent or the stream is on its way down.
    Closing,
    /// The stream is gone.
    Closed,
}

/// Something that happened on a WebSocket connection.
#[derive(Debug)]
pub enum WsEvent {
    /// The handshake completed; messages can now be sent.
    Open,
    /// A complete message arrived.
    Message {
        /// Whether this is text or binary data.
        ty: DataType,
        /// The message contents, defragmented.
        data: Bytes,
    },
    /// The connection finished closing. This is the final event.
    Closed {
        /// The peer's close code, zero when none was received.
        code: u16,
        /// The peer's close reason, when one was sent and valid UTF-8.
        reason: Option<String>,
        /// Whether this close was unclean (error or unexpected EOF).
        dirty: bool,
    },
}

/// Configuration for the connecting side.
#[derive(Debug, Default)]
pub struct ClientConfig {
    /// Value for the `Host` header.
    pub host: String,
    /// The resource path to request.
    pub path: String,
    /// The `Origin` to present; `null` when absent.
    pub origin: Option<String>,
    /// Sub-protocols to offer, in preference order.
    pub protocols: Vec<String>,
    /// Extra headers for the upgrade request.
    pub headers: Vec<(String, String)>,
}

/// Configuration for the accepting side.
#[derive(Debug, Default)]
pub struct ServerConfig {
    /// Sub-protocols the server will speak; `None` accepts any.
    pub protocols: Option<Vec<String>>,
    /// Origin whitelist; requests with no or other origins get 403.
    pub origins: Option<Vec<String>>,
}

enum Side {
    Client {
        config: ClientConfig,
        accept: String,
        key: String,
        request_sent: bool,
    },
    Server {
        config: ServerConfig,
    },
}

struct OutFrame {
    data: Bytes,
    sent: usize,
    amount: usize,
    last: bool,
}

/// A WebSocket connection over any byte stream.
pub struct WebSocket<S> {
    io: S,
    side: Side,

    incoming: BytesMut,
    outgoing: VecDeque<OutFrame>,
    output_queued: usize,

    handshake_done: bool,
    close_sent: bool,
    close_received: bool,
    dirty_close: bool,
    stop_input: bool,
    read_done: bool,
    want_shutdown: bool,
    io_closed: bool,

    peer_close_code: u16,
    peer_close_reason: Option<String>,
    chosen_protocol: Option<String>,

    message_opcode: u8,
    message_data: Option<BytesMut>,

    close_timer: Option<Pin<Box<Sleep>>>,

    pressure: PressureSender,
    pressure_rx: Option<PressureReceiver>,
    throttle: Throttled,
    input_paused: bool,

    events: VecDeque<WsEvent>,
    finished: bool,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates the connecting side over an already established stream.
    pub fn client(io: S, config: ClientConfig) -> WebSocket<S> {
        let key = handshake::generate_key();
        let accept = handshake::accept_key(&key);
        WebSocket::new(
            io,
            Side::Client {
                config,
                accept,
                key,
                request_sent: false,
            },
        )
    }

    /// Creates the accepting side over an accepted stream.
    pub fn server(io: S, config: ServerConfig) -> WebSocket<S> {
        WebSocket::new(io, Side::Server { config })
    }

    fn new(io: S, side: Side) -> WebSocket<S> {
        let (pressure_tx, pressure_rx) = pressure();
        WebSocket {
            io,
            side,
            incoming: BytesMut::with_capacity(1024),
            outgoing: VecDeque::new(),
            output_queued: 0,
            handshake_done: false,
            close_sent: false,
            close_received: false,
            dirty_close: false,
            stop_input: false,
            read_done: false,
            want_shutdown: false,
            io_closed: false,
            peer_close_code: 0,
            peer_close_reason: None,
            chosen_protocol: None,
            message_opcode: 0,
            message_data: None,
            close_timer: None,
            pressure: pressure_tx,
            pressure_rx: Some(pressure_rx),
            throttle: Throttled::new(),
            input_paused: false,
            events: VecDeque::new(),
            finished: false,
        }
    }

    fn server_side(&self) -> bool {
        matches!(self.side, Side::Server { .. })
    }

    /// The current connection state.
    pub fn ready_state(&self) -> ReadyState {
        if self.io_closed {
            ReadyState::Closed
        } else if self.close_sent {
            ReadyState::Closing
        } else if self.handshake_done {
            ReadyState::Open
        } else {
            ReadyState::Connecting
        }
    }

    /// The sub-protocol agreed on during the handshake, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.chosen_protocol.as_deref()
    }

    /// Bytes of caller messages queued but not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.outgoing.iter().map(|frame| frame.amount).sum()
    }

    /// Takes the receiver observing this connection's pressure edges.
    pub fn pressure_receiver(&mut self) -> Option<PressureReceiver> {
        self.pressure_rx.take()
    }

    /// Lets `controlling` pause this connection's reading side while it
    /// reports pressure.
    pub fn throttle(&mut self, controlling: Option<PressureReceiver>) {
        self.throttle.throttle(controlling);
    }

    /// Sends a message. The connection must be open, and text must be
    /// valid UTF-8.
    pub fn send(&mut self, ty: DataType, data: &[u8]) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::new_invalid_state());
        }

        if ty == DataType::Text && std::str::from_utf8(data).is_err() {
            return Err(Parse::Utf8.into());
        }

        let (bytes, amount) = build_frame(!self.server_side(), ty.opcode(), b"", data);
        self.queue_frame(bytes, amount, false, false);
        Ok(())
    }

    /// Starts an orderly close with the given code and reason.
    ///
    /// The close frame carries the 2-byte code followed by up to 123 bytes
    /// of UTF-8 reason. `Closed` is delivered once the close handshake
    /// completes or times out.
    pub fn close(&mut self, code: u16, reason: Option<&str>) -> Result<()> {
        if self.close_sent {
            return Err(Error::new_closed());
        }

        if self.close_received {
            debug!("responding to close request");
        }

        if self.handshake_done {
            let last = self.server_side() && self.close_received;
            self.send_close(code, reason, false, last);
            self.close_io_after_timeout();
        } else {
            self.close_io();
        }
        Ok(())
    }

    /// Drives the connection, resolving with the next event. After the
    /// `Closed` event this resolves with `None` forever.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<WsEvent>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.finished {
                // Propagate our EOF so the peer does not sit out the close
                // grace period.
                if self.want_shutdown {
                    if let Poll::Ready(result) = Pin::new(&mut self.io).poll_shutdown(cx) {
                        self.want_shutdown = false;
                        if let Err(err) = result {
                            debug!("error shutting down io stream: {}", err);
                        }
                    }
                }
                return Poll::Ready(None);
            }

            if let Side::Client {
                ref config,
                ref key,
                ref mut request_sent,
                ..
            } = self.side
            {
                if !*request_sent {
                    *request_sent = true;
                    let mut request = handshake::client_request(
                        &config.host,
                        &config.path,
                        key,
                        config.origin.as_deref(),
                        &config.protocols,
                    );
                    for (name, value) in &config.headers {
                        let extra = format!("{}: {}\r\n", name, value);
                        request.insert_str(request.len() - 2, &extra);
                    }
                    trace!("queued handshake request");
                    self.queue_frame(Bytes::from(request), 0, true, false);
                    continue;
                }
            }

            while let Poll::Ready(pressured) = self.throttle.poll_edge(cx) {
                if pressured {
                    debug!("applying back pressure in web socket");
                } else {
                    debug!("relieving back pressure in web socket");
                }
                self.input_paused = pressured;
            }

            self.poll_write(cx);

            if let Some(timer) = self.close_timer.as_mut() {
                if timer.as_mut().poll(cx).is_ready() {
                    warn!("peer did not close io when expected");
                    self.close_io();
                }
            }

            if !self.events.is_empty() {
                continue;
            }

            if self.can_read() {
                match self.poll_read(cx) {
                    Poll::Ready(Ok(0)) => {
                        self.read_done = true;
                        self.process_incoming();
                        if !self.close_sent || !self.close_received {
                            self.dirty_close = true;
                            warn!("connection unexpectedly closed by peer");
                        } else {
                            debug!("peer has closed socket");
                        }
                        self.close_io();
                        continue;
                    }
                    Poll::Ready(Ok(_)) => {
                        self.process_incoming();
                        continue;
                    }
                    Poll::Ready(Err(err)) => {
                        warn!("web socket read failed: {}", err);
                        self.dirty_close = true;
                        self.close_io();
                        continue;
                    }
                    Poll::Pending => (),
                }
            }

            if !self.events.is_empty() {
                continue;
            }
            return Poll::Pending;
        }
    }

    fn can_read(&self) -> bool {
        !self.stop_input && !self.input_paused && !self.read_done && !self.io_closed
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        self.incoming.reserve(READ_CHUNK);
        tokio_util::io::poll_read_buf(Pin::new(&mut self.io), cx, &mut self.incoming)
    }

    fn poll_write(&mut self, cx: &mut Context<'_>) {
        while let Some(front) = self.outgoing.front_mut() {
            match Pin::new(&mut self.io).poll_write(cx, &front.data[front.sent..]) {
                Poll::Ready(Ok(0)) => {
                    warn!("web socket write made no progress");
                    self.dirty_close = true;
                    self.close_io();
                    return;
                }
                Poll::Ready(Ok(n)) => {
                    front.sent += n;
                    if front.sent < front.data.len() {
                        continue;
                    }

                    trace!("sent frame");
                    let frame = self.outgoing.pop_front().expect("front frame exists");
                    let before = self.output_queued;
                    self.output_queued -= frame.data.len();

                    if before >= QUEUE_PRESSURE && self.output_queued < QUEUE_PRESSURE {
                        self.pressure.set(false);
                    }

                    if frame.last {
                        if self.server_side() {
                            self.close_io();
                        } else {
                            self.want_shutdown = true;
                            self.close_io_after_timeout();
                        }
                    }
                }
                Poll::Ready(Err(err)) => {
                    warn!("web socket write failed: {}", err);
                    self.dirty_close = true;
                    self.close_io();
                    return;
                }
                Poll::Pending => return,
            }
        }

        if self.want_shutdown {
            // Half-close our writing direction; the grace timer bounds how
            // long we wait for the peer's EOF.
            if let Poll::Ready(result) = Pin::new(&mut self.io).poll_shutdown(cx) {
                self.want_shutdown = false;
                if let Err(err) = result {
                    debug!("error shutting down io stream: {}", err);
                }
            }
        }
    }

    fn queue_frame(&mut self, data: Bytes, amount: usize, urgent: bool, last: bool) {
        debug_assert!(!data.is_empty());
        let len = data.len();
        let frame = OutFrame {
            data,
            sent: 0,
            amount,
            last,
        };

        if urgent {
            // Urgent frames jump the queue, but cannot interrupt a frame
            // already partially written.
            match self.outgoing.front() {
                Some(front) if front.sent > 0 => self.outgoing.insert(1, frame),
                _ => self.outgoing.push_front(frame),
            }
        } else {
            self.outgoing.push_back(frame);
        }

        let before = self.output_queued;
        self.output_queued += len;

        if before < QUEUE_PRESSURE && self.output_queued >= QUEUE_PRESSURE {
            self.pressure.set(true);
        }
    }

    fn send_close(&mut self, code: u16, reason: Option<&str>, urgent: bool, last: bool) {
        let mut payload = Vec::with_capacity(128);
        if code != 0 {
            payload.extend_from_slice(&code.to_be_bytes());
            if let Some(reason) = reason {
                let mut reason = reason.as_bytes();
                if reason.len() > 123 {
                    reason = &reason[..123];
                }
                payload.extend_from_slice(reason);
            }
        }

        let (bytes, amount) = build_frame(!self.server_side(), opcode::CLOSE, b"", &payload);
        self.queue_frame(bytes, amount, urgent, last);
        self.close_sent = true;
    }

    fn close_io_after_timeout(&mut self) {
        if self.close_timer.is_none() {
            debug!("waiting {:?} for peer to close io", CLOSE_GRACE);
            self.close_timer = Some(Box::pin(sleep(CLOSE_GRACE)));
        }
    }

    fn close_io(&mut self) {
        if self.io_closed {
            return;
        }
        self.io_closed = true;
        self.close_timer = None;
        self.stop_input = true;
        self.want_shutdown = true;
        debug!("closed: io stream done");
        self.events.push_back(WsEvent::Closed {
            code: self.peer_close_code,
            reason: self.peer_close_reason.clone(),
            dirty: self.dirty_close,
        });
        self.finished = true;
    }

    fn error_close(&mut self, code: u16, prejudice: bool) {
        self.dirty_close = true;

        let prejudice = prejudice || !self.handshake_done;

        match self.ready_state() {
            ReadyState::Closed => {
                debug!("already closed, ignoring error");
                return;
            }
            ReadyState::Closing if !prejudice => {
                debug!("already closing, ignoring error");
                return;
            }
            _ => (),
        }

        if prejudice {
            debug!("forcing close due to error");
            self.close_io();
        } else {
            debug!("requesting close due to error");
            self.send_close(code, None, true, true);
        }
    }

    fn protocol_error_close(&mut self) {
        warn!(
            "received invalid WebSocket data from the {}",
            if self.server_side() { "client" } else { "server" }
        );
        self.error_close(close_code::PROTOCOL, false);
    }

    fn process_incoming(&mut self) {
        if !self.handshake_done && !self.io_closed {
            let done = if self.server_side() {
                self.server_handshake()
            } else {
                self.client_handshake()
            };
            if done {
                self.handshake_done = true;
                self.events.push_back(WsEvent::Open);
            }
        }

        while self.handshake_done && !self.stop_input {
            match parse_frame(&mut self.incoming) {
                Parsed::NeedMore => break,
                Parsed::TooBig(size) => {
                    warn!(
                        "peer is trying to frame of size {} or greater, but max supported size is 128KiB",
                        size
                    );
                    self.error_close(close_code::TOO_BIG, true);
                    self.stop_input = true;
                    break;
                }
                Parsed::Frame(frame) => self.process_contents(frame),
            }
        }
    }

    fn process_contents(&mut self, frame: InboundFrame) {
        if frame.control {
            if !frame.fin {
                warn!("received fragmented control frame");
                self.protocol_error_close();
                return;
            }
            if frame.payload.len() > 125 {
                warn!("received oversized control frame");
                self.protocol_error_close();
                return;
            }

            trace!(
                "received control frame {} with {} payload",
                frame.opcode,
                frame.payload.len()
            );
            match frame.opcode {
                opcode::CLOSE => self.receive_close(&frame.payload),
                opcode::PING => {
                    trace!("received ping, responding");
                    let (bytes, amount) =
                        build_frame(!self.server_side(), opcode::PONG, b"", &frame.payload);
                    self.queue_frame(bytes, amount, true, false);
                }
                opcode::PONG => (),
                other => warn!("received unsupported control frame: {}", other),
            }
            return;
        }

        if self.close_received {
            warn!("received message after close was received");
            return;
        }

        // Fragmentation bookkeeping: an initial fragment must not arrive
        // mid-message, middles and the ending need one in progress.
        let in_progress = self.message_data.is_some();
        let ordered = if frame.opcode == opcode::CONTINUATION {
            in_progress
        } else {
            !in_progress
        };
        if !ordered {
            warn!("received out of order message fragment");
            self.protocol_error_close();
            return;
        }

        if frame.opcode != 0 {
            self.message_opcode = frame.opcode;
            self.message_data = Some(BytesMut::with_capacity(frame.payload.len()));
        }

        match self.message_opcode {
            opcode::TEXT | opcode::BINARY => {
                self.message_data
                    .as_mut()
                    .expect("message assembly in progress")
                    .extend_from_slice(&frame.payload);
            }
            other => {
                debug!("received unknown data frame: {}", other);
            }
        }

        if frame.fin {
            let data = self.message_data.take().unwrap_or_default().freeze();
            let op = self.message_opcode;
            self.message_opcode = 0;

            let ty = match op {
                opcode::TEXT => {
                    if std::str::from_utf8(&data).is_err() {
                        warn!("received invalid non-UTF8 text data");
                        self.error_close(close_code::BAD_DATA, false);
                        return;
                    }
                    DataType::Text
                }
                opcode::BINARY => DataType::Binary,
                _ => return,
            };

            trace!("message: delivering {} with {} length", op, data.len());
            self.events.push_back(WsEvent::Message { ty, data });
        }
    }

    fn receive_close(&mut self, payload: &[u8]) {
        self.peer_close_code = 0;
        self.peer_close_reason = None;
        self.close_received = true;

        if payload.len() >= 2 {
            self.peer_close_code = u16::from_be_bytes([payload[0], payload[1]]);
        }
        if payload.len() > 2 {
            match std::str::from_utf8(&payload[2..]) {
                Ok(reason) => self.peer_close_reason = Some(reason.to_owned()),
                Err(_) => warn!("received non-UTF8 close data"),
            }
        }

        if self.close_sent {
            // The close handshake is complete in both directions.
            self.want_shutdown = true;
            if self.server_side() {
                self.close_io();
            }
        } else {
            let code = self.peer_close_code;
            let _ = self.close(code, None);
        }
    }

    fn server_handshake(&mut self) -> bool {
        let head = match handshake::parse_request(&self.incoming) {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!("waiting for more handshake data");
                return false;
            }
            Err(_) => {
                warn!("received invalid request line");
                self.respond_bad(handshake::RESPONSE_BAD);
                return false;
            }
        };
        let _ = self.incoming.split_to(head.consumed);

        if head.method != "GET" {
            warn!("received unexpected method: {} {}", head.method, head.path);
            self.respond_bad(handshake::RESPONSE_BAD);
            return false;
        }

        let config = match self.side {
            Side::Server { ref config } => config,
            Side::Client { .. } => unreachable!("server handshake on client"),
        };

        let headers = &head.headers;
        if !handshake::header_equals(headers, "upgrade", "websocket")
            || !handshake::header_contains(headers, "connection", "upgrade")
            || !handshake::header_equals(headers, "sec-websocket-version", "13")
        {
            self.respond_bad(handshake::RESPONSE_BAD);
            return false;
        }

        let chosen = match handshake::choose_protocol(
            config.protocols.as_deref(),
            headers.get("sec-websocket-protocol").map(String::as_str),
        ) {
            Ok(chosen) => chosen,
            Err(()) => {
                self.respond_bad(handshake::RESPONSE_BAD);
                return false;
            }
        };

        let key = match headers.get("sec-websocket-key") {
            Some(key) if handshake::validate_key(key) => key.clone(),
            Some(key) => {
                warn!("received invalid Sec-WebSocket-Key header: {}", key);
                self.respond_bad(handshake::RESPONSE_BAD);
                return false;
            }
            None => {
                warn!("received missing Sec-WebSocket-Key header");
                self.respond_bad(handshake::RESPONSE_BAD);
                return false;
            }
        };

        if !headers.contains_key("host") {
            warn!("received request without Host");
            self.respond_bad(handshake::RESPONSE_BAD);
            return false;
        }

        if let Some(ref origins) = config.origins {
            match headers.get("origin") {
                None => {
                    warn!("received request without Origin");
                    self.respond_bad(handshake::RESPONSE_FORBIDDEN);
                    return false;
                }
                Some(origin) => {
                    if !origins.iter().any(|o| o.eq_ignore_ascii_case(origin)) {
                        warn!("received request from bad Origin: {}", origin);
                        self.respond_bad(handshake::RESPONSE_FORBIDDEN);
                        return false;
                    }
                }
            }
        }

        self.chosen_protocol = chosen;
        let accept = handshake::accept_key(&key);
        let response = handshake::server_response(&accept, self.chosen_protocol.as_deref());
        self.queue_frame(Bytes::from(response), 0, true, false);
        debug!("open: responded to handshake");
        true
    }

    fn client_handshake(&mut self) -> bool {
        let head = match handshake::parse_response(&self.incoming) {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!("waiting for more handshake data");
                return false;
            }
            Err(_) => {
                warn!("received invalid status line");
                self.error_close(close_code::PROTOCOL, true);
                return false;
            }
        };
        let _ = self.incoming.split_to(head.consumed);

        if head.status != 101 {
            warn!("received unexpected status: {} {}", head.status, head.reason);
            self.error_close(close_code::PROTOCOL, false);
            return false;
        }

        let (accept, offered) = match self.side {
            Side::Client {
                ref accept,
                ref config,
                ..
            } => (accept.clone(), config.protocols.clone()),
            Side::Server { .. } => unreachable!("client handshake on server"),
        };

        let headers = &head.headers;
        let offered = if offered.is_empty() {
            None
        } else {
            Some(offered)
        };

        let protocol_ok = handshake::choose_protocol(
            offered.as_deref(),
            headers.get("sec-websocket-protocol").map(String::as_str),
        );

        let verified = handshake::header_equals(headers, "upgrade", "websocket")
            && handshake::header_contains(headers, "connection", "upgrade")
            && protocol_ok.is_ok()
            && handshake::header_empty(headers, "sec-websocket-extensions")
            && headers
                .get("sec-websocket-accept")
                .map_or(false, |value| value.eq_ignore_ascii_case(&accept));

        if !verified {
            warn!("received invalid WebSocket handshake from the server");
            self.error_close(close_code::PROTOCOL, true);
            return false;
        }

        self.chosen_protocol = protocol_ok.expect("verified above");
        debug!("open: handshake completed");
        true
    }

    fn respond_bad(&mut self, response: &'static str) {
        self.queue_frame(Bytes::from_static(response.as_bytes()), 0, true, true);
        self.dirty_close = true;
        self.stop_input = true;
    }
}

impl<S> std::fmt::Debug for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("server_side", &self.server_side())
            .field("state", &self.ready_state())
            .field("protocol", &self.chosen_protocol)
            .finish()
    }
}
