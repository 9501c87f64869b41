#![allow(dead_code)]

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

/// Writes one protocol frame to the raw side of a transport under test.
pub async fn write_frame(io: &mut DuplexStream, channel: Option<&str>, payload: &[u8]) {
    let channel = channel.unwrap_or("");
    let frame = format!("{}\n{}\n", channel.len() + 1 + payload.len(), channel);
    io.write_all(frame.as_bytes()).await.unwrap();
    io.write_all(payload).await.unwrap();
}

/// Writes one control frame built from JSON members.
pub async fn write_control(io: &mut DuplexStream, options: Value) {
    let payload = serde_json::to_vec(&options).unwrap();
    write_frame(io, None, &payload).await;
}

/// Reads one protocol frame from the raw side, with a safety timeout.
pub async fn read_frame(io: &mut DuplexStream) -> (Option<String>, Bytes) {
    timeout(Duration::from_secs(10), read_frame_inner(io))
        .await
        .expect("timed out waiting for a frame")
}

async fn read_frame_inner(io: &mut DuplexStream) -> (Option<String>, Bytes) {
    let mut prefix = Vec::new();
    loop {
        let b = io.read_u8().await.expect("frame length prefix");
        if b == b'\n' {
            break;
        }
        assert!(b.is_ascii_digit(), "invalid length prefix byte: {}", b);
        prefix.push(b);
        assert!(prefix.len() <= 7, "length prefix too long");
    }
    let size: usize = std::str::from_utf8(&prefix).unwrap().parse().unwrap();

    let mut message = vec![0u8; size];
    io.read_exact(&mut message).await.expect("frame payload");

    let pos = message
        .iter()
        .position(|b| *b == b'\n')
        .expect("channel separator");
    let channel = if pos == 0 {
        None
    } else {
        Some(String::from_utf8(message[..pos].to_vec()).unwrap())
    };
    (channel, Bytes::from(message.split_off(pos + 1)))
}

/// Reads a control frame and returns its parsed object.
pub async fn read_control(io: &mut DuplexStream) -> Map<String, Value> {
    let (channel, payload) = read_frame(io).await;
    assert_eq!(channel, None, "expected a control frame");
    match serde_json::from_slice(&payload).expect("control payload is JSON") {
        Value::Object(map) => map,
        other => panic!("control payload is not an object: {:?}", other),
    }
}

/// Shorthand for a string member of a control message.
pub fn member<'a>(options: &'a Map<String, Value>, name: &str) -> &'a str {
    options
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("no string member {:?} in {:?}", name, options))
}

/// The raw peer side of a transport, with non-blocking frame extraction.
///
/// Useful when the test must interleave driving the engines with watching
/// for their output, without a read blocking the loop.
pub struct FramePeer {
    io: DuplexStream,
    buf: bytes::BytesMut,
}

impl FramePeer {
    pub fn new(io: DuplexStream) -> FramePeer {
        FramePeer {
            io,
            buf: bytes::BytesMut::new(),
        }
    }

    /// Pulls whatever bytes are ready into the local buffer.
    pub async fn fill(&mut self) {
        use std::pin::Pin;
        use std::task::Poll;

        std::future::poll_fn(|cx| {
            loop {
                self.buf.reserve(4096);
                match tokio_util::io::poll_read_buf(Pin::new(&mut self.io), cx, &mut self.buf) {
                    Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) | Poll::Pending => {
                        return Poll::Ready(())
                    }
                    Poll::Ready(Ok(_)) => continue,
                }
            }
        })
        .await
    }

    /// Takes one complete frame off the buffer, if there is one.
    pub fn try_frame(&mut self) -> Option<(Option<String>, Bytes)> {
        let mut size = 0usize;
        let mut digits = 0;
        for b in self.buf.iter() {
            if !b.is_ascii_digit() {
                break;
            }
            size = size * 10 + usize::from(b - b'0');
            digits += 1;
        }
        if digits == self.buf.len() || self.buf[digits] != b'\n' {
            return None;
        }
        if self.buf.len() < digits + 1 + size {
            return None;
        }

        let _ = self.buf.split_to(digits + 1);
        let message = self.buf.split_to(size).freeze();
        let pos = message.iter().position(|b| *b == b'\n').expect("separator");
        let channel = if pos == 0 {
            None
        } else {
            Some(String::from_utf8(message[..pos].to_vec()).unwrap())
        };
        Some((channel, message.slice(pos + 1..)))
    }

    /// Writes one frame to the transport under test.
    pub async fn send_frame(&mut self, channel: Option<&str>, payload: &[u8]) {
        write_frame(&mut self.io, channel, payload).await;
    }

    /// Writes one control frame built from JSON.
    pub async fn send_control(&mut self, options: Value) {
        write_control(&mut self.io, options).await;
    }
}
