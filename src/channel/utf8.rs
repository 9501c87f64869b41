//! UTF-8 handling for text channels.
//!
//! A text channel may be handed bytes cut in the middle of a multi-byte
//! sequence. The incomplete tail is held back and coalesced with the next
//! send; whatever still is not valid when the buffer finally flushes gets
//! the replacement character.

use bytes::Bytes;

/// Does the data end in the middle of a multi-byte UTF-8 sequence?
///
/// Only the last three bytes can matter: a sequence is at most four bytes
/// long, so a lead byte further back is either complete or already invalid.
pub(crate) fn has_incomplete_ending(data: &[u8]) -> bool {
    let len = data.len();
    let start = len.saturating_sub(3);

    for pos in (start..len).rev() {
        let byte = data[pos];
        if byte & 0b1100_0000 == 0b1100_0000 {
            let expected = if byte & 0b1111_1000 == 0b1111_0000 {
                4
            } else if byte & 0b1111_0000 == 0b1110_0000 {
                3
            } else if byte & 0b1110_0000 == 0b1100_0000 {
                2
            } else {
                // Invalid lead byte, nothing to wait for.
                return false;
            };
            return expected > len - pos;
        }
        if byte & 0b1100_0000 != 0b1000_0000 {
            // ASCII; no sequence runs past it.
            return false;
        }
    }

    false
}

/// Replaces invalid sequences with U+FFFD. Valid input passes through
/// without copying.
pub(crate) fn force_utf8(data: Bytes) -> Bytes {
    match String::from_utf8_lossy(&data) {
        std::borrow::Cow::Borrowed(_) => data,
        std::borrow::Cow::Owned(replaced) => Bytes::from(replaced),
    }
}
