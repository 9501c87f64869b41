//! The channel base engine.
//!
//! A channel is one logically independent message stream multiplexed over a
//! [`Transport`](crate::transport::Transport). This module owns everything
//! every channel has in common: the ready/freeze lifecycle, close
//! negotiation, EOF bookkeeping, capability checks, windowed ping/pong flow
//! control and the UTF-8 coalescing applied to text payloads. Concrete
//! payload types implement [`ChannelKind`] and only deal with their own
//! semantics.
//!
//! A channel starts frozen on the transport. The implementation performs
//! whatever asynchronous preparation it needs and then calls
//! [`Channel::ready`], which thaws the transport so that buffered messages
//! are delivered in their original order. That makes `ready` reach the peer
//! strictly before any input the peer sends afterwards.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration, Sleep};
use tracing::{debug, trace, warn};

use crate::error::Problem;
use crate::flow::{pressure, PressureReceiver, PressureSender, Throttled};
use crate::json;
use crate::transport::{TransportEvent, TransportHandle};

mod utf8;

/// Every this many payload bytes sent, a flow-control ping goes out.
const FLOW_PING: i64 = 16 * 1024;

/// How much data may be sent without acknowledgement before the channel
/// reports pressure.
const FLOW_WINDOW: i64 = 2 * 1024 * 1024;

/// How long an incomplete UTF-8 tail waits for its continuation.
const UTF8_TIMEOUT: Duration = Duration::from_millis(500);

/// The payload-specific half of a channel.
///
/// The engine calls these hooks; everything else (ready, send, close, flow
/// control) is driven through the [`Channel`] passed to each of them.
pub trait ChannelKind {
    /// The capabilities this implementation supports, matched against the
    /// `capabilities` open option.
    fn capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called once after construction, before any input is delivered. The
    /// default is to declare readiness immediately.
    fn prepare(&mut self, chan: &mut Channel) {
        chan.ready(None);
    }

    /// Called for every inbound data frame.
    fn recv(&mut self, chan: &mut Channel, payload: Bytes);

    /// Called for control commands the engine does not own.
    fn control(&mut self, chan: &mut Channel, command: &str, options: &Map<String, Value>) {
        let _ = (chan, command, options);
    }

    /// Implementation-specific teardown, before the close message is sent.
    fn close(&mut self, chan: &mut Channel, problem: Option<&Problem>) {
        let _ = (chan, problem);
    }

    /// Drives any sockets, timers or futures the implementation owns.
    fn poll_drive(&mut self, chan: &mut Channel, cx: &mut Context<'_>) {
        let _ = (chan, cx);
    }
}

/// The state shared by every channel, handed to [`ChannelKind`] hooks.
pub struct Channel {
    id: String,
    transport: TransportHandle,
    options: Map<String, Value>,

    binary_ok: bool,
    flow_control: bool,
    ready: bool,

    sent_close: bool,
    emitted_close: bool,
    pending_close: Option<Option<Problem>>,
    transport_closed: bool,

    sent_done: bool,
    received_done: bool,

    close_options: Option<Map<String, Value>>,

    out_buffer: Option<BytesMut>,
    buffer_timeout: Option<Pin<Box<Sleep>>>,

    out_sequence: i64,
    out_window: i64,
    pressure: PressureSender,
    pressure_rx: Option<PressureReceiver>,
    throttle: Throttled,
    throttled_pings: Option<VecDeque<Map<String, Value>>>,
}

impl Channel {
    fn new(id: &str, transport: TransportHandle, options: Map<String, Value>) -> Channel {
        let (pressure_tx, pressure_rx) = pressure();
        transport.freeze(id);
        Channel {
            id: id.to_owned(),
            transport,
            options,
            binary_ok: false,
            flow_control: false,
            ready: false,
            sent_close: false,
            emitted_close: false,
            pending_close: None,
            transport_closed: false,
            sent_done: false,
            received_done: false,
            close_options: None,
            out_buffer: None,
            buffer_timeout: None,
            out_sequence: 0,
            out_window: FLOW_WINDOW,
            pressure: pressure_tx,
            pressure_rx: Some(pressure_rx),
            throttle: Throttled::new(),
            throttled_pings: None,
        }
    }

    /// The channel identifier, unique on its transport.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The open options this channel was created with.
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// The transport handle, for implementations that spawn helpers.
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Declares the implementation ready for input. Messages the transport
    /// buffered while frozen are redelivered in arrival order, and a
    /// `ready` control message carrying `options` goes to the peer.
    pub fn ready(&mut self, options: Option<Map<String, Value>>) {
        self.ready = true;
        self.transport.thaw(&self.id);
        self.control("ready", options);
    }

    /// Queues a data payload on this channel.
    ///
    /// Unless the payload is declared trustworthy or the channel is binary,
    /// an incomplete trailing UTF-8 sequence is held back for up to 500 ms
    /// and merged into the next send, then force-validated.
    pub fn send(&mut self, payload: Bytes, trust_is_utf8: bool) {
        self.buffer_timeout = None;

        let mut trust = trust_is_utf8;
        let data = match self.out_buffer.take() {
            Some(mut held) => {
                held.extend_from_slice(&payload);
                trust = false;
                held.freeze()
            }
            None => payload,
        };

        if !trust && !self.binary_ok && utf8::has_incomplete_ending(&data) {
            let mut held = BytesMut::with_capacity(data.len());
            held.extend_from_slice(&data);
            self.out_buffer = Some(held);
            self.buffer_timeout = Some(Box::pin(sleep(UTF8_TIMEOUT)));
            return;
        }

        self.actual_send(data, trust);
    }

    /// Sends a control message on this channel.
    ///
    /// `done` sends EOF and may happen at most once. `close` is routed
    /// through [`Channel::close`], keeping the passed options as close
    /// options.
    pub fn control(&mut self, command: &str, options: Option<Map<String, Value>>) {
        if command == "done" {
            if self.sent_done {
                warn!("{}: refusing to send second done", self.id);
                return;
            }
            self.sent_done = true;
        } else if command == "close" {
            let problem = match options {
                Some(options) => {
                    let problem = json::get_str(&options, "problem")
                        .ok()
                        .flatten()
                        .map(Problem::from);
                    if self.close_options.is_none() {
                        self.close_options = Some(options);
                    }
                    problem
                }
                None => None,
            };
            self.close(problem);
            return;
        }

        let mut object = options.unwrap_or_default();
        object.insert("command".into(), Value::String(command.into()));
        object.insert("channel".into(), Value::String(self.id.clone()));
        self.transport.control(&object);
    }

    /// Closes the channel. Idempotent; the implementation hook runs, the
    /// close message is sent, and the registry reports the channel closed.
    pub fn close(&mut self, problem: Option<Problem>) {
        if self.emitted_close || self.pending_close.is_some() {
            return;
        }
        self.pending_close = Some(problem);
    }

    /// Closes with a problem and a human-readable `message` close option.
    pub fn fail(&mut self, problem: Problem, message: &str) {
        warn!("{}: {}", self.id, message);
        let options = self.close_options_mut();
        if !options.contains_key("message") {
            options.insert("message".into(), Value::String(message.into()));
        }
        self.close(Some(problem));
    }

    /// Options merged into the eventual close message.
    pub fn close_options_mut(&mut self) -> &mut Map<String, Value> {
        self.close_options.get_or_insert_with(Map::new)
    }

    /// Whether the channel accepts raw binary payloads.
    pub fn is_binary(&self) -> bool {
        self.binary_ok
    }

    /// Whether the peer already sent its EOF.
    pub fn received_done(&self) -> bool {
        self.received_done
    }

    /// Takes the receiver that observes this channel's pressure edges.
    /// Whatever feeds data into this channel should subscribe here and
    /// pause on `true`.
    pub fn pressure_receiver(&mut self) -> Option<PressureReceiver> {
        self.pressure_rx.take()
    }

    /// Lets `controlling` throttle this channel: while it reports
    /// pressure, replies to inbound pings are held and replayed on release.
    pub fn throttle(&mut self, controlling: Option<PressureReceiver>) {
        self.throttle.throttle(controlling);
    }

    fn actual_send(&mut self, data: Bytes, trust_is_utf8: bool) {
        debug_assert!(self.out_buffer.is_none());

        let payload = if !trust_is_utf8 && !self.binary_ok {
            utf8::force_utf8(data)
        } else {
            data
        };

        let size = payload.len() as i64;
        self.transport.send(Some(&self.id), payload);

        if !self.flow_control {
            return;
        }

        let out_sequence = self.out_sequence.saturating_add(size);

        // Crossing the window is an edge, not a level, so that relieving
        // pressure cannot retrigger it without new data.
        let trigger_pressure =
            self.out_sequence <= self.out_window && out_sequence > self.out_window;

        // A ping goes out every FLOW_PING bytes, and also when applying
        // back pressure, as nothing else would elicit the next ack.
        if out_sequence / FLOW_PING != self.out_sequence / FLOW_PING || trigger_pressure {
            let mut ping = Map::new();
            ping.insert("sequence".into(), Value::from(out_sequence));
            trace!("{}: sending ping with sequence: {}", self.id, out_sequence);
            self.control("ping", Some(ping));
        }

        self.out_sequence = out_sequence;

        if trigger_pressure {
            debug!(
                "{}: sent too much data without acknowledgement, emitting back pressure until {}",
                self.id, self.out_window
            );
            self.pressure.set(true);
        }
    }

    fn flush_buffer(&mut self) {
        self.buffer_timeout = None;
        if let Some(held) = self.out_buffer.take() {
            self.actual_send(held.freeze(), false);
        }
    }

    fn process_ping(&mut self, options: Map<String, Value>) {
        if self.throttled_pings.is_some() {
            debug!("{}: received ping while throttled", self.id);
            self.throttled_pings
                .as_mut()
                .expect("throttled queue present")
                .push_back(options);
        } else {
            trace!("{}: replying to ping with pong", self.id);
            let mut pong = options;
            pong.insert("command".into(), Value::String("pong".into()));
            self.transport.control(&pong);
        }
    }

    fn process_pong(&mut self, options: &Map<String, Value>) {
        if !self.flow_control {
            return;
        }

        let sequence = json::get_int(options, "sequence", -1).unwrap_or_else(|_| {
            warn!("{}: received invalid \"pong\" \"sequence\" field", self.id);
            -1
        });

        trace!("{}: received pong with sequence: {}", self.id, sequence);
        if sequence > self.out_window + FLOW_WINDOW * 10 {
            warn!(
                "{}: received a flow control ack with a suspiciously large sequence: {}",
                self.id, sequence
            );
        }

        if sequence >= self.out_window {
            self.out_window = sequence + FLOW_WINDOW;
            if self.out_sequence <= self.out_window {
                debug!(
                    "{}: got acknowledge of enough data, relieving back pressure",
                    self.id
                );
                self.pressure.set(false);
            }
        }
    }

    fn poll_internal(&mut self, cx: &mut Context<'_>) {
        if let Some(timeout) = self.buffer_timeout.as_mut() {
            if timeout.as_mut().poll(cx).is_ready() {
                self.flush_buffer();
            }
        }

        while let Poll::Ready(pressured) = self.throttle.poll_edge(cx) {
            if pressured {
                if self.throttled_pings.is_none() {
                    self.throttled_pings = Some(VecDeque::new());
                }
            } else if let Some(queued) = self.throttled_pings.take() {
                for ping in queued {
                    self.process_ping(ping);
                }
            }
        }
    }

    fn send_close_message(&mut self, problem: &Option<Problem>) {
        if self.sent_close {
            return;
        }
        self.sent_close = true;

        if self.transport_closed {
            return;
        }

        self.flush_buffer();

        let mut object = self.close_options.take().unwrap_or_default();
        object.insert("command".into(), Value::String("close".into()));
        object.insert("channel".into(), Value::String(self.id.clone()));
        if let Some(problem) = problem {
            object.insert(
                "problem".into(),
                Value::String(problem.as_str().to_owned()),
            );
        }
        self.transport.control(&object);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("ready", &self.ready)
            .field("closed", &self.emitted_close)
            .finish()
    }
}

/// A channel closed and was removed from the registry.
#[derive(Debug)]
pub struct ChannelClosed {
    /// The channel identifier.
    pub id: String,
    /// Why it closed; `None` for an orderly close.
    pub problem: Option<Problem>,
}

type Factory = Box<dyn FnMut(&Map<String, Value>) -> Box<dyn ChannelKind>>;

struct Entry {
    core: Channel,
    kind: Box<dyn ChannelKind>,
}

/// Owns the channels living on one transport and routes events to them.
///
/// Feed every [`TransportEvent`] to [`Channels::handle_event`] before
/// polling the transport again, and call [`Channels::poll`] from the same
/// task to drive timers, pressure edges and implementation IO.
pub struct Channels {
    transport: TransportHandle,
    factories: HashMap<String, Factory>,
    entries: HashMap<String, Entry>,
    prepare_queue: VecDeque<String>,
    closed: VecDeque<ChannelClosed>,
}

impl Channels {
    /// Creates an empty registry sending through `transport`.
    pub fn new(transport: TransportHandle) -> Channels {
        Channels {
            transport,
            factories: HashMap::new(),
            entries: HashMap::new(),
            prepare_queue: VecDeque::new(),
            closed: VecDeque::new(),
        }
    }

    /// Registers a constructor for a payload type carried in `open`
    /// messages.
    pub fn register<F>(&mut self, payload: &str, factory: F)
    where
        F: FnMut(&Map<String, Value>) -> Box<dyn ChannelKind> + 'static,
    {
        self.factories.insert(payload.to_owned(), Box::new(factory));
    }

    /// Attaches a locally created channel, as the side that initiated the
    /// open. The channel starts frozen and prepares on the next poll.
    pub fn attach(&mut self, id: &str, options: Map<String, Value>, kind: Box<dyn ChannelKind>) {
        let core = Channel::new(id, self.transport.clone(), options);
        self.entries.insert(id.to_owned(), Entry { core, kind });
        self.prepare_queue.push_back(id.to_owned());
    }

    /// Whether a channel with this id is still alive.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Gives mutable access to a live channel, for embedders.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Channel> {
        self.entries.get_mut(id).map(|entry| &mut entry.core)
    }

    /// Routes one transport event to the channels it concerns.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Recv { channel, payload } => {
                if let Some(entry) = self.entries.get_mut(&channel) {
                    if entry.core.received_done {
                        entry
                            .core
                            .fail(Problem::ProtocolError, "channel received message after done");
                    } else {
                        entry.kind.recv(&mut entry.core, payload);
                    }
                } else {
                    debug!("received message for unknown channel {}", channel);
                }
            }
            TransportEvent::Control {
                command,
                channel,
                options,
                ..
            } => match channel {
                Some(id) => self.handle_control(&command, &id, options),
                None => trace!("ignoring channel-less control: {}", command),
            },
            TransportEvent::Closed { problem } => {
                for entry in self.entries.values_mut() {
                    entry.core.transport_closed = true;
                    entry
                        .core
                        .close(Some(problem.clone().unwrap_or(Problem::Disconnected)));
                }
            }
        }
        self.sweep();
    }

    /// Drives preparation, timers, pressure edges and implementation IO,
    /// yielding closed notifications.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<ChannelClosed> {
        while let Some(id) = self.prepare_queue.pop_front() {
            self.prepare(&id);
        }

        for entry in self.entries.values_mut() {
            entry.core.poll_internal(cx);
            if entry.core.pending_close.is_none() {
                entry.kind.poll_drive(&mut entry.core, cx);
            }
        }

        self.sweep();

        match self.closed.pop_front() {
            Some(notice) => Poll::Ready(notice),
            None => Poll::Pending,
        }
    }

    fn handle_control(&mut self, command: &str, id: &str, options: Map<String, Value>) {
        if command == "open" {
            self.handle_open(id, options);
            return;
        }

        let entry = match self.entries.get_mut(id) {
            Some(entry) => entry,
            None => {
                debug!("received control for unknown channel {}: {}", id, command);
                return;
            }
        };

        match command {
            "close" => {
                debug!("close channel {}", id);
                let problem = json::get_str(&options, "problem")
                    .ok()
                    .flatten()
                    .map(Problem::from);
                entry.core.close(problem);
            }
            "ping" => entry.core.process_ping(options),
            "pong" => entry.core.process_pong(&options),
            "ready" => trace!("channel {} peer is ready", id),
            "done" => {
                if entry.core.received_done {
                    entry
                        .core
                        .fail(Problem::ProtocolError, "channel received second done");
                } else {
                    entry.core.received_done = true;
                    entry.kind.control(&mut entry.core, command, &options);
                }
            }
            other => entry.kind.control(&mut entry.core, other, &options),
        }
    }

    fn handle_open(&mut self, id: &str, options: Map<String, Value>) {
        if self.entries.contains_key(id) {
            warn!("channel {} already exists", id);
            self.transport.close(Some(Problem::ProtocolError));
            return;
        }

        let payload = match json::get_str(&options, "payload") {
            Ok(Some(payload)) => payload.to_owned(),
            _ => String::new(),
        };

        let kind = match self.factories.get_mut(&payload) {
            Some(factory) => factory(&options),
            None => {
                debug!("channel {} has unsupported payload: {}", id, payload);
                Box::new(Unsupported)
            }
        };

        self.attach(id, options, kind);
    }

    fn prepare(&mut self, id: &str) {
        let entry = match self.entries.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };

        if !entry.core.check_capable(entry.kind.capabilities()) {
            self.sweep();
            return;
        }

        if entry.core.validate_options() && entry.core.pending_close.is_none() {
            entry.kind.prepare(&mut entry.core);
        }

        self.sweep();
    }

    fn sweep(&mut self) {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.core.pending_close.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let mut entry = match self.entries.remove(&id) {
                Some(entry) => entry,
                None => continue,
            };
            let problem = entry
                .core
                .pending_close
                .take()
                .expect("sweep only visits closing channels");
            entry.core.emitted_close = true;
            entry.kind.close(&mut entry.core, problem.as_ref());
            entry.core.send_close_message(&problem);
            self.closed.push_back(ChannelClosed { id, problem });
        }
    }
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels")
            .field("open", &self.entries.len())
            .finish()
    }
}

impl Channel {
    fn check_capable(&mut self, supported: &[&str]) -> bool {
        let capabilities = match json::get_strv(&self.options, "capabilities") {
            Ok(capabilities) => capabilities,
            Err(_) => {
                self.fail(
                    Problem::ProtocolError,
                    "got invalid capabilities field in open message",
                );
                return false;
            }
        };

        let capabilities = match capabilities {
            Some(capabilities) => capabilities,
            None => return true,
        };

        let mut missing = false;
        for capability in &capabilities {
            if !supported.contains(&capability.as_str()) {
                warn!("{}: unsupported capability required: {}", self.id, capability);
                missing = true;
            }
        }

        if missing {
            let declared: Vec<Value> = supported
                .iter()
                .map(|c| Value::String((*c).to_owned()))
                .collect();
            self.close_options_mut()
                .insert("capabilities".into(), Value::Array(declared));
            self.close(Some(Problem::NotSupported));
        }

        !missing
    }

    fn validate_options(&mut self) -> bool {
        let binary = match json::get_str(&self.options, "binary") {
            Ok(binary) => binary.map(str::to_owned),
            Err(_) => {
                self.fail(Problem::ProtocolError, "channel has invalid \"binary\" option");
                return false;
            }
        };
        match binary.as_deref() {
            None => (),
            Some("raw") => self.binary_ok = true,
            Some(other) => {
                let message = format!("channel has invalid \"binary\" option: {}", other);
                self.fail(Problem::ProtocolError, &message);
                return false;
            }
        }

        match json::get_bool(&self.options, "flow-control", false) {
            Ok(flow_control) => self.flow_control = flow_control,
            Err(_) => {
                self.fail(
                    Problem::ProtocolError,
                    "channel has invalid \"flow-control\" option",
                );
                return false;
            }
        }

        true
    }
}

/// Stand-in for open requests naming a payload nobody registered.
struct Unsupported;

impl ChannelKind for Unsupported {
    fn prepare(&mut self, chan: &mut Channel) {
        chan.close(Some(Problem::NotSupported));
    }

    fn recv(&mut self, _chan: &mut Channel, _payload: Bytes) {}
}
