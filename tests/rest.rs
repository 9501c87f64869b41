#![deny(rust_2018_idioms)]

//! REST channel tests against scripted HTTP/1.0 servers.

use std::future::poll_fn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::time::{sleep, Duration, Instant};

use gangway::channel::{ChannelClosed, Channels};
use gangway::rest::RestJson;
use gangway::transport::Transport;

mod support;

use support::{member, FramePeer};

struct Harness {
    transport: Transport<tokio::io::DuplexStream>,
    channels: Channels,
    closed: Vec<ChannelClosed>,
}

impl Harness {
    fn new() -> (Harness, FramePeer) {
        let (ours, theirs) = tokio::io::duplex(4 * 1024 * 1024);
        let transport = Transport::new(ours, "test");
        let mut channels = Channels::new(transport.handle());
        channels.register("rest-json1", |_options| Box::new(RestJson::new()));
        (
            Harness {
                transport,
                channels,
                closed: Vec::new(),
            },
            FramePeer::new(theirs),
        )
    }

    /// One pass over transport and channels.
    async fn pump(&mut self) {
        let transport = &mut self.transport;
        let channels = &mut self.channels;
        let closed = &mut self.closed;
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
        })
        .await;
        tokio::task::yield_now().await;
    }
}

/// Drives the harness until the peer produces a frame.
async fn next_frame(harness: &mut Harness, peer: &mut FramePeer) -> (Option<String>, Bytes) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        harness.pump().await;
        peer.fill().await;
        if let Some(frame) = peer.try_frame() {
            return frame;
        }
        assert!(Instant::now() < deadline, "timed out waiting for a frame");
        sleep(Duration::from_millis(1)).await;
    }
}

async fn next_control(harness: &mut Harness, peer: &mut FramePeer) -> Map<String, Value> {
    let (channel, payload) = next_frame(harness, peer).await;
    assert_eq!(channel, None, "expected control, got data: {:?}", payload);
    match serde_json::from_slice(&payload).unwrap() {
        Value::Object(map) => map,
        other => panic!("not an object: {:?}", other),
    }
}

async fn next_reply(harness: &mut Harness, peer: &mut FramePeer, id: &str) -> Value {
    let (channel, payload) = next_frame(harness, peer).await;
    assert_eq!(channel.as_deref(), Some(id), "expected a data frame");
    serde_json::from_slice(&payload).unwrap()
}

/// Opens a rest-json1 channel over a unix socket and waits for ready.
async fn open_unix(harness: &mut Harness, peer: &mut FramePeer, path: &str, id: &str) {
    peer.send_control(json!({
        "command": "open",
        "channel": id,
        "payload": "rest-json1",
        "unix": path,
    }))
    .await;

    let ready = next_control(harness, peer).await;
    assert_eq!(member(&ready, "command"), "ready");
    assert_eq!(member(&ready, "channel"), id);
}

fn socket_path(name: &str) -> String {
    let dir = std::env::temp_dir();
    format!(
        "{}/gangway-test-{}-{}",
        dir.display(),
        std::process::id(),
        name
    )
}

/// Reads one HTTP request head (plus any body it advertises).
async fn read_request<S>(io: &mut S) -> String
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if io.read_exact(&mut byte).await.is_err() {
            break;
        }
        buf.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&buf).to_string();

    if let Some(pos) = head.find("Content-Length: ") {
        let length: usize = head[pos + 16..]
            .lines()
            .next()
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut body = vec![0u8; length];
        if length > 0 {
            io.read_exact(&mut body).await.unwrap();
        }
    }
    head
}

#[tokio::test]
async fn simple_get() {
    let path = socket_path("simple");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let head = read_request(&mut conn).await;
        assert!(head.starts_with("GET / HTTP/1.0\r\n"));
        conn.write_all(
            b"HTTP/1.0 200 OK\r\nContent-Length:18\r\n\r\n{ \"key\": \"value\" }",
        )
        .await
        .unwrap();
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "r").await;

    peer.send_frame(
        Some("r"),
        br#"{"method":"GET","path":"/","cookie":0}"#,
    )
    .await;

    let reply = next_reply(&mut harness, &mut peer, "r").await;
    assert_eq!(
        reply,
        json!({
            "cookie": 0,
            "status": 200,
            "message": "OK",
            "complete": true,
            "body": { "key": "value" },
        })
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn post_sends_json_body() {
    let path = socket_path("post");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        let head = String::from_utf8(buf).unwrap();
        assert!(head.starts_with("POST /add HTTP/1.0\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));

        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        let mut body = vec![0u8; length];
        conn.read_exact(&mut body).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "a": 1 }));

        conn.write_all(b"HTTP/1.0 201 Created\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "r").await;

    peer.send_frame(
        Some("r"),
        br#"{"method":"POST","path":"/add","cookie":9,"body":{"a":1}}"#,
    )
    .await;

    let reply = next_reply(&mut harness, &mut peer, "r").await;
    assert_eq!(
        reply,
        json!({
            "cookie": 9,
            "status": 201,
            "message": "Created",
            "complete": true,
        })
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn tcp_port_with_address_lookup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let _ = read_request(&mut conn).await;
            let _ = conn
                .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\n{}")
                .await;
        }
    });

    let (mut harness, mut peer) = Harness::new();
    peer.send_control(json!({
        "command": "open",
        "channel": "t",
        "payload": "rest-json1",
        "port": port,
    }))
    .await;

    let ready = next_control(&mut harness, &mut peer).await;
    assert_eq!(member(&ready, "command"), "ready");

    peer.send_frame(Some("t"), br#"{"method":"GET","path":"/","cookie":1}"#)
        .await;
    let reply = next_reply(&mut harness, &mut peer, "t").await;
    assert_eq!(reply.get("status"), Some(&json!(200)));
    assert_eq!(reply.get("complete"), Some(&json!(true)));
}

#[tokio::test]
async fn both_port_and_unix_is_protocol_error() {
    let (mut harness, mut peer) = Harness::new();
    peer.send_control(json!({
        "command": "open",
        "channel": "x",
        "payload": "rest-json1",
        "port": 80,
        "unix": "/nowhere",
    }))
    .await;

    let close = next_control(&mut harness, &mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "problem"), "protocol-error");
}

#[tokio::test]
async fn invalid_method_is_protocol_error() {
    let path = socket_path("badmethod");
    let _ = std::fs::remove_file(&path);
    let _listener = UnixListener::bind(&path).unwrap();

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "r").await;

    peer.send_frame(
        Some("r"),
        br#"{"method":"GE T","path":"/","cookie":0}"#,
    )
    .await;

    let close = next_control(&mut harness, &mut peer).await;
    assert_eq!(member(&close, "problem"), "protocol-error");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn poll_suppresses_unchanged_bodies() {
    let path = socket_path("poll");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    // Ten successive polls see each body twice, then a 404 ends it.
    tokio::spawn(async move {
        let bodies: Vec<String> = (0..5)
            .flat_map(|n| {
                let body = format!("{{\"key\":{}}}", n);
                vec![body.clone(), body]
            })
            .collect();
        let mut served = 0usize;
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            loop {
                let head = read_request(&mut conn).await;
                if head.is_empty() {
                    break;
                }
                let response = if served < bodies.len() {
                    let body = &bodies[served];
                    format!(
                        "HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
                };
                served += 1;
                if conn.write_all(response.as_bytes()).await.is_err() {
                    break;
                }
                if response.starts_with("HTTP/1.0 404") {
                    break;
                }
            }
        }
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "p").await;

    peer.send_frame(
        Some("p"),
        br#"{"method":"GET","path":"/poll","cookie":0,"poll":{"interval":20}}"#,
    )
    .await;

    // Five changing bodies come through, every duplicate suppressed, and
    // the 404 terminates the poll.
    for n in 0..5 {
        let reply = next_reply(&mut harness, &mut peer, "p").await;
        assert_eq!(
            reply.get("body"),
            Some(&json!({ "key": n })),
            "unexpected reply: {:?}",
            reply
        );
        assert_eq!(reply.get("complete"), None);
    }

    let reply = next_reply(&mut harness, &mut peer, "p").await;
    assert_eq!(reply.get("status"), Some(&json!(404)));
    assert_eq!(reply.get("complete"), Some(&json!(true)));
    assert_eq!(reply.get("body"), None);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn watch_triggers_immediate_poll() {
    let path = socket_path("watch");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let polls = Arc::new(AtomicUsize::new(0));
    let polls_served = polls.clone();
    let (dribble_tx, mut dribble_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        let mut counter = 0usize;
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let head = read_request(&mut conn).await;
            if head.starts_with("GET /stream") {
                // An endless response dribbling bytes on demand.
                conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
                while dribble_rx.recv().await.is_some() {
                    if conn.write_all(b"{\"tick\": true} ").await.is_err() {
                        break;
                    }
                }
            } else {
                counter += 1;
                polls_served.fetch_add(1, Ordering::SeqCst);
                let body = format!("{{\"count\":{}}}", counter);
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = conn.write_all(response.as_bytes()).await;
            }
        }
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "w").await;

    // The watched request first, then the poll watching it, with no
    // interval of its own.
    peer.send_frame(
        Some("w"),
        br#"{"method":"GET","path":"/stream","cookie":5}"#,
    )
    .await;
    peer.send_frame(
        Some("w"),
        br#"{"method":"GET","path":"/status","cookie":0,"poll":{"interval":0,"watch":5}}"#,
    )
    .await;

    // Initial dispatch of the poll happens on registration.
    let reply = next_reply(&mut harness, &mut peer, "w").await;
    assert_eq!(reply.get("cookie"), Some(&json!(0)));
    assert_eq!(reply.get("body"), Some(&json!({ "count": 1 })));

    // Traffic on the stream pokes the watcher into polling again.
    dribble_tx.send(()).unwrap();
    let mut got: Vec<Value> = Vec::new();
    while got.len() < 2 {
        let reply = next_reply(&mut harness, &mut peer, "w").await;
        got.push(reply);
    }

    // One reply is the stream's own data, the other the re-poll.
    assert!(got.iter().any(|r| r.get("cookie") == Some(&json!(5))));
    assert!(got
        .iter()
        .any(|r| r.get("body") == Some(&json!({ "count": 2 }))));
    assert!(polls.load(Ordering::SeqCst) >= 2);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn cookie_reuse_cancels_prior() {
    let path = socket_path("cancel");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        // First connection never answers; second one does.
        let (mut first, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut first).await;

        let (mut second, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut second).await;
        second
            .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 16\r\n\r\n{\"winner\": true}")
            .await
            .unwrap();

        // Keep the first connection alive but silent.
        let _ = first.read_u8().await;
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "c").await;

    peer.send_frame(Some("c"), br#"{"method":"GET","path":"/slow","cookie":7}"#)
        .await;
    // Give the first request time to get under way.
    for _ in 0..20 {
        harness.pump().await;
        sleep(Duration::from_millis(1)).await;
    }

    peer.send_frame(Some("c"), br#"{"method":"GET","path":"/fast","cookie":7}"#)
        .await;

    let reply = next_reply(&mut harness, &mut peer, "c").await;
    assert_eq!(reply.get("cookie"), Some(&json!(7)));
    assert_eq!(reply.get("body"), Some(&json!({ "winner": true })));
    assert_eq!(reply.get("complete"), Some(&json!(true)));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn cancel_unknown_cookie_is_noop() {
    let path = socket_path("noop");
    let _ = std::fs::remove_file(&path);
    let _listener = UnixListener::bind(&path).unwrap();

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "n").await;

    // A method-less request cancels; unknown cookies are fine.
    peer.send_frame(Some("n"), br#"{"cookie":42,"path":"/x"}"#).await;
    for _ in 0..10 {
        harness.pump().await;
    }
    assert!(harness.closed.is_empty());

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn keep_alive_reuses_one_connection() {
    let path = socket_path("keepalive");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    let connections_seen = connections.clone();

    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            connections_seen.fetch_add(1, Ordering::SeqCst);
            loop {
                let head = read_request(&mut conn).await;
                if head.is_empty() {
                    break;
                }
                if conn
                    .write_all(
                        b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\
                          Content-Length: 11\r\n\r\n{\"pet\": 42}",
                    )
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "k").await;

    peer.send_frame(Some("k"), br#"{"method":"GET","path":"/a","cookie":1}"#)
        .await;
    let reply = next_reply(&mut harness, &mut peer, "k").await;
    assert_eq!(reply.get("complete"), Some(&json!(true)));

    peer.send_frame(Some("k"), br#"{"method":"GET","path":"/b","cookie":2}"#)
        .await;
    let reply = next_reply(&mut harness, &mut peer, "k").await;
    assert_eq!(reply.get("complete"), Some(&json!(true)));

    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "the keep-alive socket was reused"
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn truncated_response_closes_channel() {
    let path = socket_path("truncated");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut conn).await;
        conn.write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 50\r\n\r\n{\"cut\"")
            .await
            .unwrap();
        // Hang up mid-body.
    });

    let (mut harness, mut peer) = Harness::new();
    open_unix(&mut harness, &mut peer, &path, "t").await;

    peer.send_frame(Some("t"), br#"{"method":"GET","path":"/","cookie":3}"#)
        .await;

    let close = next_control(&mut harness, &mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "problem"), "protocol-error");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn missing_address_is_not_found() {
    let path = socket_path("absent");
    let _ = std::fs::remove_file(&path);

    let (mut harness, mut peer) = Harness::new();
    peer.send_control(json!({
        "command": "open",
        "channel": "m",
        "payload": "rest-json1",
        "unix": path,
    }))
    .await;

    // The unix path exists as an address, so the channel goes ready; the
    // failure surfaces on first use.
    let ready = next_control(&mut harness, &mut peer).await;
    assert_eq!(member(&ready, "command"), "ready");

    peer.send_frame(Some("m"), br#"{"method":"GET","path":"/","cookie":0}"#)
        .await;
    let close = next_control(&mut harness, &mut peer).await;
    assert_eq!(member(&close, "command"), "close");
    assert_eq!(member(&close, "problem"), "not-found");
}
