#![deny(rust_2018_idioms)]

//! Tests of the channel base engine: lifecycle, flow control, freezing and
//! the UTF-8 coalescing applied to text payloads.

use std::future::poll_fn;
use std::task::Poll;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::io::DuplexStream;
use tokio::time::{advance, timeout, Duration};

use gangway::channel::{Channel, ChannelClosed, ChannelKind, Channels};
use gangway::transport::Transport;
use gangway::Problem;

mod support;

use support::{member, read_control, read_frame, write_control, write_frame};

/// A channel that reflects received payloads back and obeys test commands.
struct EchoChannel;

impl EchoChannel {
    fn new() -> EchoChannel {
        EchoChannel
    }
}

impl ChannelKind for EchoChannel {
    fn capabilities(&self) -> &'static [&'static str] {
        &["reflect"]
    }

    fn recv(&mut self, chan: &mut Channel, payload: Bytes) {
        chan.send(payload, false);
    }

    fn control(&mut self, chan: &mut Channel, command: &str, options: &Map<String, Value>) {
        if command == "blast" {
            // Send a configurable amount of data to exercise flow control.
            let count = options.get("count").and_then(Value::as_u64).unwrap_or(1);
            let size = options.get("size").and_then(Value::as_u64).unwrap_or(1024);
            for _ in 0..count {
                chan.send(Bytes::from(vec![b'x'; size as usize]), true);
            }
        }
    }
}

struct Harness {
    transport: Transport<DuplexStream>,
    channels: Channels,
    closed: Vec<ChannelClosed>,
}

impl Harness {
    fn new() -> (Harness, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024 * 1024);
        let transport = Transport::new(ours, "test");
        let mut channels = Channels::new(transport.handle());
        channels.register("echo", |_options| Box::new(EchoChannel::new()));
        (
            Harness {
                transport,
                channels,
                closed: Vec::new(),
            },
            theirs,
        )
    }

    /// Runs transport and channels until both go idle.
    async fn pump(&mut self) {
        let transport = &mut self.transport;
        let channels = &mut self.channels;
        let closed = &mut self.closed;
        timeout(
            Duration::from_secs(10),
            poll_fn(|cx| {
                loop {
                    match transport.poll_event(cx) {
                        Poll::Ready(Some(event)) => channels.handle_event(event),
                        Poll::Ready(None) | Poll::Pending => break,
                    }
                }
                while let Poll::Ready(notice) = channels.poll(cx) {
                    closed.push(notice);
                }
                Poll::Ready(())
            }),
        )
        .await
        .expect("pump timed out");
        tokio::task::yield_now().await;
    }

    async fn pump_n(&mut self, times: usize) {
        for _ in 0..times {
            self.pump().await;
        }
    }
}

async fn open_echo(peer: &mut DuplexStream, harness: &mut Harness, id: &str) {
    write_control(
        peer,
        json!({ "command": "open", "channel": id, "payload": "echo" }),
    )
    .await;
    harness.pump_n(2).await;

    let ready = read_control(peer).await;
    assert_eq!(member(&ready, "command"), "ready");
    assert_eq!(member(&ready, "channel"), id);
}

#[tokio::test]
async fn open_ready_echo_close() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "a").await;

    write_frame(&mut peer, Some("a"), b"marmalade").await;
    harness.pump_n(2).await;

    let (channel, payload) = read_frame(&mut peer).await;
    assert_eq!(channel.as_deref(), Some("a"));
    assert_eq!(&payload[..], b"marmalade");

    write_control(&mut peer, json!({ "command": "close", "channel": "a" })).await;
    harness.pump_n(2).await;

    let close = read_control(&mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "channel"), "a");
    assert!(close.get("problem").is_none());

    assert_eq!(harness.closed.len(), 1);
    assert_eq!(harness.closed[0].id, "a");
    assert_eq!(harness.closed[0].problem, None);
    assert!(!harness.channels.contains("a"));
}

#[tokio::test]
async fn messages_before_ready_are_held() {
    let (mut harness, mut peer) = Harness::new();

    // Open and immediately send data; the channel must still see it, and
    // only after its ready went out.
    write_control(
        &mut peer,
        json!({ "command": "open", "channel": "a", "payload": "echo" }),
    )
    .await;
    write_frame(&mut peer, Some("a"), b"early").await;
    harness.pump_n(3).await;

    let ready = read_control(&mut peer).await;
    assert_eq!(member(&ready, "command"), "ready");

    let (channel, payload) = read_frame(&mut peer).await;
    assert_eq!(channel.as_deref(), Some("a"));
    assert_eq!(&payload[..], b"early");
}

#[tokio::test]
async fn unknown_payload_not_supported() {
    let (mut harness, mut peer) = Harness::new();

    write_control(
        &mut peer,
        json!({ "command": "open", "channel": "u", "payload": "warp-drive" }),
    )
    .await;
    harness.pump_n(2).await;

    let close = read_control(&mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "problem"), "not-supported");
}

#[tokio::test]
async fn missing_capability_not_supported() {
    let (mut harness, mut peer) = Harness::new();

    write_control(
        &mut peer,
        json!({
            "command": "open",
            "channel": "c",
            "payload": "echo",
            "capabilities": ["reflect", "levitate"],
        }),
    )
    .await;
    harness.pump_n(2).await;

    let close = read_control(&mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "problem"), "not-supported");
    assert_eq!(
        close.get("capabilities"),
        Some(&json!(["reflect"])),
        "close carries the supported capability list"
    );
}

#[tokio::test]
async fn supported_capability_accepted() {
    let (mut harness, mut peer) = Harness::new();

    write_control(
        &mut peer,
        json!({
            "command": "open",
            "channel": "c",
            "payload": "echo",
            "capabilities": ["reflect"],
        }),
    )
    .await;
    harness.pump_n(2).await;

    let ready = read_control(&mut peer).await;
    assert_eq!(member(&ready, "command"), "ready");
}

#[tokio::test]
async fn invalid_binary_option_fails() {
    let (mut harness, mut peer) = Harness::new();

    write_control(
        &mut peer,
        json!({
            "command": "open",
            "channel": "b",
            "payload": "echo",
            "binary": "base64",
        }),
    )
    .await;
    harness.pump_n(2).await;

    let close = read_control(&mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "problem"), "protocol-error");
    assert!(member(&close, "message").contains("binary"));
}

#[tokio::test]
async fn second_done_is_protocol_error() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "d").await;

    write_control(&mut peer, json!({ "command": "done", "channel": "d" })).await;
    write_control(&mut peer, json!({ "command": "done", "channel": "d" })).await;
    harness.pump_n(2).await;

    let close = read_control(&mut peer).await;
    assert_eq!(member(&close, "problem"), "protocol-error");
}

#[tokio::test]
async fn data_after_done_is_protocol_error() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "d").await;

    write_control(&mut peer, json!({ "command": "done", "channel": "d" })).await;
    write_frame(&mut peer, Some("d"), b"too late").await;
    harness.pump_n(2).await;

    let close = read_control(&mut peer).await;
    assert_eq!(member(&close, "problem"), "protocol-error");
}

#[tokio::test]
async fn transport_death_closes_channels() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "a").await;
    drop(peer);
    harness.pump_n(2).await;

    assert_eq!(harness.closed.len(), 1);
    assert_eq!(harness.closed[0].problem, Some(Problem::Disconnected));
}

#[tokio::test]
async fn ping_answered_with_pong() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "f").await;

    write_control(
        &mut peer,
        json!({ "command": "ping", "channel": "f", "sequence": 33 }),
    )
    .await;
    harness.pump_n(2).await;

    let pong = read_control(&mut peer).await;
    assert_eq!(member(&pong, "command"), "pong");
    assert_eq!(member(&pong, "channel"), "f");
    assert_eq!(pong.get("sequence").and_then(Value::as_i64), Some(33));
}

#[tokio::test]
async fn flow_control_pressure_edges() {
    let (mut harness, mut peer) = Harness::new();

    write_control(
        &mut peer,
        json!({
            "command": "open",
            "channel": "f",
            "payload": "echo",
            "flow-control": true,
            "binary": "raw",
        }),
    )
    .await;
    harness.pump_n(2).await;

    let ready = read_control(&mut peer).await;
    assert_eq!(member(&ready, "command"), "ready");

    let pressure = harness
        .channels
        .get_mut("f")
        .and_then(Channel::pressure_receiver);
    let mut pressure = pressure.expect("pressure receiver available");

    // Ten sends of one megabyte: crosses the 2 MiB window once.
    write_control(
        &mut peer,
        json!({
            "command": "blast",
            "channel": "f",
            "count": 10,
            "size": 1024 * 1024,
        }),
    )
    .await;
    harness.pump_n(2).await;

    let edge = poll_fn(|cx| pressure.poll_edge(cx)).await;
    assert!(edge, "first edge is pressure on");
    assert!(
        poll_fn(|cx| Poll::Ready(pressure.poll_edge(cx).is_pending())).await,
        "pressure on is edge triggered, not repeated"
    );

    // Drain the data and pings the channel produced; find the last ping.
    let mut last_ping = None;
    let mut payload_total = 0;
    while payload_total < 10 * 1024 * 1024 {
        let (channel, payload) = read_frame(&mut peer).await;
        match channel.as_deref() {
            Some("f") => payload_total += payload.len(),
            None => {
                let control: Map<String, Value> = match serde_json::from_slice(&payload) {
                    Ok(Value::Object(map)) => map,
                    _ => panic!("bad control"),
                };
                assert_eq!(member(&control, "command"), "ping");
                last_ping = control.get("sequence").and_then(Value::as_i64);
            }
            Some(other) => panic!("unexpected channel {}", other),
        }
    }
    let last_ping = last_ping.expect("pings were sent");
    assert!(last_ping >= 2 * 1024 * 1024);

    // Acknowledge everything: pressure must drop exactly once.
    write_control(
        &mut peer,
        json!({ "command": "pong", "channel": "f", "sequence": last_ping }),
    )
    .await;
    harness.pump_n(2).await;

    let edge = poll_fn(|cx| pressure.poll_edge(cx)).await;
    assert!(!edge, "pressure released after acknowledge");
}

#[tokio::test(start_paused = true)]
async fn utf8_tail_coalesced_with_next_send() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "u").await;

    let snowman = "\u{2603}".as_bytes();
    write_frame(&mut peer, Some("u"), &snowman[..2]).await;
    harness.pump_n(2).await;
    write_frame(&mut peer, Some("u"), &snowman[2..]).await;
    harness.pump_n(2).await;

    // The echo held the partial character and sent it whole.
    let (_, payload) = read_frame(&mut peer).await;
    assert_eq!(&payload[..], snowman);
}

#[tokio::test(start_paused = true)]
async fn utf8_tail_flushed_after_timeout() {
    let (mut harness, mut peer) = Harness::new();

    open_echo(&mut peer, &mut harness, "u").await;

    let snowman = "\u{2603}".as_bytes();
    write_frame(&mut peer, Some("u"), &snowman[..2]).await;
    harness.pump_n(2).await;

    advance(Duration::from_millis(600)).await;
    harness.pump_n(2).await;

    // The incomplete tail was replaced, not dropped.
    let (_, payload) = read_frame(&mut peer).await;
    assert_eq!(&payload[..], "\u{FFFD}".as_bytes());
}
