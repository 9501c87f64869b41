//! Length-prefixed framing for the bridge message protocol.
//!
//! On the wire every message looks like:
//!
//! ```text
//! <decimal length>\n<channel id>\n<payload>
//! ```
//!
//! where the length covers the channel id, its trailing newline and the
//! payload. An empty channel id marks a control message, whose payload is a
//! JSON object carrying at least a `command` member.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{Error, Parse};

/// Decimal length prefixes longer than this are rejected outright, as a
/// defence against pathological input.
const MAX_PREFIX_DIGITS: usize = 7;

/// One frame of the bridge protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The channel the payload belongs to, `None` for control messages.
    pub channel: Option<String>,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a control frame from a JSON object.
    pub fn control(options: &Map<String, Value>) -> Frame {
        Frame {
            channel: None,
            payload: serde_json::to_vec(&Value::Object(options.clone()))
                .expect("control message serializes")
                .into(),
        }
    }
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug, Default)]
pub struct FrameCodec {
    _priv: (),
}

impl FrameCodec {
    /// Creates a codec. The codec is stateless between frames.
    pub fn new() -> FrameCodec {
        FrameCodec::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            let mut size: usize = 0;
            let mut digits = 0;
            for &b in src.iter() {
                if digits >= MAX_PREFIX_DIGITS || !b.is_ascii_digit() {
                    break;
                }
                size = size * 10 + usize::from(b - b'0');
                digits += 1;
            }

            if digits == src.len() {
                return Ok(None);
            }

            if src[digits] != b'\n' {
                return Err(Parse::FramePrefix.into());
            }

            if src.len() < digits + 1 + size {
                src.reserve(digits + 1 + size - src.len());
                return Ok(None);
            }

            let _ = src.split_to(digits + 1);
            let message = src.split_to(size).freeze();

            match split_channel(message) {
                Some(frame) => return Ok(Some(frame)),
                None => {
                    warn!("received invalid message without channel prefix");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let channel = frame.channel.as_deref().unwrap_or("");
        let size = channel.len() + 1 + frame.payload.len();

        let mut buffer = itoa::Buffer::new();
        let prefix = buffer.format(size);

        dst.reserve(prefix.len() + 1 + size);
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(b'\n');
        dst.put_slice(channel.as_bytes());
        dst.put_u8(b'\n');
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

fn split_channel(message: Bytes) -> Option<Frame> {
    let pos = message.iter().position(|&b| b == b'\n')?;

    let channel = if pos == 0 {
        None
    } else {
        match std::str::from_utf8(&message[..pos]) {
            Ok(id) if !id.contains('\0') => Some(id.to_owned()),
            _ => return None,
        }
    };

    Some(Frame {
        channel,
        payload: message.slice(pos + 1..),
    })
}

/// A validated control message.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    /// The command, a non-empty string.
    pub command: String,
    /// The channel the command is about, if any.
    pub channel: Option<String>,
    /// The full message object, including `command` and `channel`.
    pub options: Map<String, Value>,
}

/// Parses and validates a control payload.
///
/// The payload must be a JSON object with a non-empty string `command`, and
/// an optional `channel` that is a non-empty string without newlines.
pub fn parse_command(payload: &[u8]) -> Result<ControlMessage, Error> {
    let options: Map<String, Value> = match serde_json::from_slice(payload) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("received unparsable control message: not an object");
            return Err(Parse::Command.into());
        }
        Err(err) => {
            warn!("received unparsable control message: {}", err);
            return Err(Error::from(Parse::Command).with(err));
        }
    };

    let command = match options.get("command") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            warn!("received invalid control message: invalid or missing command");
            return Err(Parse::Command.into());
        }
    };

    let channel = match options.get("channel") {
        None => None,
        Some(Value::String(s)) if !s.is_empty() && !s.contains('\n') => Some(s.clone()),
        Some(_) => {
            warn!("received invalid control message: invalid channel");
            return Err(Parse::Command.into());
        }
    };

    Ok(ControlMessage {
        command,
        channel,
        options,
    })
}
