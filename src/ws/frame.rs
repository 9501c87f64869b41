//! RFC 6455 frame encoding and decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Payloads this large or larger are refused; the peer gets close 1009.
pub(crate) const MAX_PAYLOAD: u64 = 128 * 1024;

pub(crate) mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// The kind of data in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Binary,
}

impl DataType {
    pub(crate) fn opcode(self) -> u8 {
        match self {
            DataType::Text => opcode::TEXT,
            DataType::Binary => opcode::BINARY,
        }
    }
}

/// One parsed inbound frame.
#[derive(Debug)]
pub(crate) struct InboundFrame {
    pub fin: bool,
    pub control: bool,
    pub opcode: u8,
    pub payload: Bytes,
}

#[derive(Debug)]
pub(crate) enum Parsed {
    /// Not enough buffered data for a whole frame.
    NeedMore,
    /// The advertised payload breaches [`MAX_PAYLOAD`].
    TooBig(u64),
    /// A complete frame, removed from the buffer.
    Frame(InboundFrame),
}

pub(crate) fn xor_mask(mask: [u8; 4], data: &mut [u8]) {
    for (n, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[n & 3];
    }
}

/// Parses one frame off the front of `incoming`, unmasking in place.
pub(crate) fn parse_frame(incoming: &mut BytesMut) -> Parsed {
    if incoming.len() < 2 {
        return Parsed::NeedMore;
    }

    let fin = incoming[0] & 0x80 != 0;
    let control = incoming[0] & 0x08 != 0;
    let opcode = incoming[0] & 0x0f;
    let masked = incoming[1] & 0x80 != 0;

    let (payload_len, mut at): (u64, usize) = match incoming[1] & 0x7f {
        126 => {
            if incoming.len() < 4 {
                return Parsed::NeedMore;
            }
            (u64::from(u16::from_be_bytes([incoming[2], incoming[3]])), 4)
        }
        127 => {
            if incoming.len() < 10 {
                return Parsed::NeedMore;
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&incoming[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        n => (u64::from(n), 2),
    };

    if payload_len >= MAX_PAYLOAD {
        return Parsed::TooBig(payload_len);
    }
    let payload_len = payload_len as usize;

    let mask = if masked {
        if incoming.len() < at + 4 {
            return Parsed::NeedMore;
        }
        let mask = [
            incoming[at],
            incoming[at + 1],
            incoming[at + 2],
            incoming[at + 3],
        ];
        at += 4;
        Some(mask)
    } else {
        None
    };

    if incoming.len() < at + payload_len {
        return Parsed::NeedMore;
    }

    incoming.advance(at);
    let mut payload = incoming.split_to(payload_len);
    if let Some(mask) = mask {
        xor_mask(mask, &mut payload);
    }

    Parsed::Frame(InboundFrame {
        fin,
        control,
        opcode,
        payload: payload.freeze(),
    })
}

/// Encodes one outbound frame.
///
/// Control message payloads are truncated to the 125 bytes the protocol
/// allows. Clients mask; servers never do. Returns the wire bytes and the
/// buffered "amount" the frame accounts for (zero for control frames).
pub(crate) fn build_frame(
    client_side: bool,
    op: u8,
    prefix: &[u8],
    payload: &[u8],
) -> (Bytes, usize) {
    let mut prefix = prefix;
    let mut payload = payload;
    let mut len = prefix.len() + payload.len();
    let mut amount = len;

    if op & 0x08 != 0 {
        if len > 125 {
            warn!("truncating WebSocket control message payload");
            if prefix.len() > 125 {
                prefix = &prefix[..125];
            }
            payload = &payload[..125 - prefix.len()];
            len = 125;
        }
        amount = 0;
    }

    let mut bytes = BytesMut::with_capacity(14 + len);
    bytes.put_u8(0x80 | op);

    if len < 126 {
        bytes.put_u8(len as u8);
    } else if len < 65536 {
        bytes.put_u8(126);
        bytes.put_u16(len as u16);
    } else {
        bytes.put_u8(127);
        bytes.put_u64(len as u64);
    }

    if client_side {
        // Servers do not expect unmasked client frames, so always mask.
        let mask: [u8; 4] = rand::random();
        bytes[1] |= 0x80;
        bytes.put_slice(&mask);

        let start = bytes.len();
        bytes.put_slice(prefix);
        bytes.put_slice(payload);
        xor_mask(mask, &mut bytes[start..]);
    } else {
        bytes.put_slice(prefix);
        bytes.put_slice(payload);
    }

    (bytes.freeze(), amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(data: &[u8]) -> InboundFrame {
        let mut buf = BytesMut::from(data);
        match parse_frame(&mut buf) {
            Parsed::Frame(frame) => {
                assert!(buf.is_empty());
                frame
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn parse_short_unmasked() {
        let frame = parse_one(&[0x81, 0x03, b'a', b'b', b'c']);
        assert!(frame.fin);
        assert!(!frame.control);
        assert_eq!(frame.opcode, opcode::TEXT);
        assert_eq!(&frame.payload[..], b"abc");
    }

    #[test]
    fn parse_masked() {
        let mask = [1u8, 2, 3, 4];
        let mut payload = *b"mask";
        xor_mask(mask, &mut payload);
        let mut data = vec![0x82, 0x84];
        data.extend_from_slice(&mask);
        data.extend_from_slice(&payload);
        let frame = parse_one(&data);
        assert_eq!(frame.opcode, opcode::BINARY);
        assert_eq!(&frame.payload[..], b"mask");
    }

    #[test]
    fn parse_len_126_boundary() {
        let payload = vec![b'x'; 126];
        let mut data = vec![0x82, 126, 0, 126];
        data.extend_from_slice(&payload);
        let frame = parse_one(&data);
        assert_eq!(frame.payload.len(), 126);

        // 125 still fits the short form.
        let mut data = vec![0x82, 125];
        data.extend_from_slice(&payload[..125]);
        assert_eq!(parse_one(&data).payload.len(), 125);
    }

    #[test]
    fn parse_len_127_form() {
        let payload = vec![b'x'; 65536];
        let mut data = vec![0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0];
        data.extend_from_slice(&payload);
        // 65536 >= MAX_PAYLOAD, so this must be refused.
        let mut buf = BytesMut::from(&data[..]);
        assert!(matches!(parse_frame(&mut buf), Parsed::TooBig(65536)));
    }

    #[test]
    fn parse_needs_more() {
        let mut buf = BytesMut::from(&[0x81u8][..]);
        assert!(matches!(parse_frame(&mut buf), Parsed::NeedMore));
        let mut buf = BytesMut::from(&[0x81u8, 0x05, b'a'][..]);
        assert!(matches!(parse_frame(&mut buf), Parsed::NeedMore));
    }

    #[test]
    fn too_big_is_refused() {
        let mut buf = BytesMut::from(&[0x82u8, 127, 0, 0, 0, 0, 0, 2, 0, 0][..]);
        assert!(matches!(parse_frame(&mut buf), Parsed::TooBig(131072)));
    }

    #[test]
    fn build_server_frame_is_unmasked() {
        let (bytes, amount) = build_frame(false, opcode::TEXT, b"", b"hello");
        assert_eq!(&bytes[..], &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(amount, 5);
    }

    #[test]
    fn build_client_frame_round_trips() {
        let (bytes, _) = build_frame(true, opcode::BINARY, b"pre", b"fix");
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = parse_one(&buf.split_to(bytes.len()));
        assert_eq!(frame.opcode, opcode::BINARY);
        assert_eq!(&frame.payload[..], b"prefix");
    }

    #[test]
    fn build_extended_lengths() {
        let payload = vec![0u8; 126];
        let (bytes, _) = build_frame(false, opcode::BINARY, b"", &payload);
        assert_eq!(bytes[1], 126);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 126);

        let payload = vec![0u8; 65536];
        let (bytes, _) = build_frame(false, opcode::BINARY, b"", &payload);
        assert_eq!(bytes[1], 127);
    }

    #[test]
    fn control_frames_truncate() {
        let payload = vec![b'r'; 200];
        let (bytes, amount) = build_frame(false, opcode::CLOSE, b"", &payload);
        assert_eq!(amount, 0);
        assert_eq!(bytes[1] & 0x7f, 125);
        assert_eq!(bytes.len(), 2 + 125);
    }
}
