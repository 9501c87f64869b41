//! The HTTP/1.1 upgrade handshake, client and server sides.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{Error, Parse};

/// Magic GUID appended to the key when computing `Sec-WebSocket-Accept`.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) const RESPONSE_BAD: &str = "HTTP/1.1 400 Bad Request\r\n\
                                       Connection: close\r\n\
                                       \r\n\
                                       <html><head><title>400 Bad Request</title></head>\r\n\
                                       <body>Received invalid WebSocket request</body></html>\r\n";

pub(crate) const RESPONSE_FORBIDDEN: &str = "HTTP/1.1 403 Forbidden\r\n\
                                             Connection: close\r\n\
                                             \r\n\
                                             <html><head><title>403 Forbidden</title></head>\r\n\
                                             <body>Received invalid WebSocket request</body></html>\r\n";

/// Computes the accept token for a handshake key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut checksum = Sha1::new();
    checksum.update(key.as_bytes());
    checksum.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(checksum.finalize())
}

/// The handshake key must be 16 bytes, base64 encoded.
pub(crate) fn validate_key(key: &str) -> bool {
    if key.is_empty() || key.len() > 1024 {
        return false;
    }
    match BASE64.decode(key.trim()) {
        Ok(decoded) => decoded.len() == 16,
        Err(_) => false,
    }
}

/// Generates a fresh client nonce key.
pub(crate) fn generate_key() -> String {
    let raw: [u8; 16] = rand::random();
    BASE64.encode(raw)
}

/// Picks the sub-protocol to speak.
///
/// With no header value the first locally accepted protocol wins. With a
/// value, it is split on commas (with optional spaces) and the first entry
/// also in the accepted list is chosen; `accepted` of `None` takes any.
/// `Err` means no agreement.
pub(crate) fn choose_protocol(
    accepted: Option<&[String]>,
    value: Option<&str>,
) -> Result<Option<String>, ()> {
    let value = match value {
        None | Some("") => {
            let chosen = accepted.and_then(|protocols| protocols.first().cloned());
            if let Some(ref protocol) = chosen {
                debug!("automatically selected protocol: {}", protocol);
            }
            return Ok(chosen);
        }
        Some(value) => value,
    };

    // Splitting on bytes is only sound for ASCII, and anything else is
    // invalid in this header anyway.
    if !value.is_ascii() {
        warn!(
            "received invalid Sec-WebSocket-Protocol, must be ASCII: {}",
            value
        );
        return Err(());
    }

    for offered in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match accepted {
            None => {
                debug!("automatically selected protocol: {}", offered);
                return Ok(Some(offered.to_owned()));
            }
            Some(protocols) => {
                if protocols.iter().any(|p| p == offered) {
                    debug!("agreed on protocol: {}", offered);
                    return Ok(Some(offered.to_owned()));
                }
            }
        }
    }

    warn!(
        "received invalid or unsupported Sec-WebSocket-Protocol: {}",
        value
    );
    Err(())
}

/// Headers of a parsed HTTP head, keyed by lowercased name.
pub(crate) type Headers = HashMap<String, String>;

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<Headers, Error> {
    let mut headers = Headers::with_capacity(parsed.len());
    for header in parsed {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::from(Parse::Http))?
            .trim()
            .to_owned();
        headers.insert(header.name.to_ascii_lowercase(), value);
    }
    Ok(headers)
}

/// A parsed request head.
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub consumed: usize,
}

/// Parses a request head; `Ok(None)` means more data is needed.
pub(crate) fn parse_request(data: &[u8]) -> Result<Option<RequestHead>, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut header_buf);
    match request.parse(data)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(consumed) => Ok(Some(RequestHead {
            method: request.method.unwrap_or("").to_owned(),
            path: request.path.unwrap_or("").to_owned(),
            headers: collect_headers(request.headers)?,
            consumed,
        })),
    }
}

/// A parsed response head.
pub(crate) struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub consumed: usize,
}

/// Parses a response head; `Ok(None)` means more data is needed.
pub(crate) fn parse_response(data: &[u8]) -> Result<Option<ResponseHead>, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_buf);
    match response.parse(data)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(consumed) => Ok(Some(ResponseHead {
            status: response.code.unwrap_or(0),
            reason: response.reason.unwrap_or("").to_owned(),
            headers: collect_headers(response.headers)?,
            consumed,
        })),
    }
}

/// Case-insensitive whole-value comparison.
pub(crate) fn header_equals(headers: &Headers, name: &str, want: &str) -> bool {
    headers
        .get(name)
        .map_or(false, |value| value.eq_ignore_ascii_case(want))
}

/// Case-insensitive, comma-separated token containment.
pub(crate) fn header_contains(headers: &Headers, name: &str, want: &str) -> bool {
    headers.get(name).map_or(false, |value| {
        value
            .split(',')
            .map(str::trim)
            .any(|token| token.eq_ignore_ascii_case(want))
    })
}

/// True when the header is absent or empty.
pub(crate) fn header_empty(headers: &Headers, name: &str) -> bool {
    headers.get(name).map_or(true, |value| value.is_empty())
}

/// Builds the client's upgrade request.
pub(crate) fn client_request(
    host: &str,
    path: &str,
    key: &str,
    origin: Option<&str>,
    protocols: &[String],
) -> String {
    let mut handshake = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        path, host, key
    );

    // An absent origin is spelled out as 'null'.
    handshake.push_str(&format!("Origin: {}\r\n", origin.unwrap_or("null")));

    if !protocols.is_empty() {
        handshake.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            protocols.join(", ")
        ));
    }

    handshake.push_str("\r\n");
    handshake
}

/// Builds the server's 101 response.
pub(crate) fn server_response(accept: &str, protocol: Option<&str>) -> String {
    let mut handshake = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept
    );

    if let Some(protocol) = protocol {
        handshake.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }

    handshake.push_str("\r\n");
    handshake
}
