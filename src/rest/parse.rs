//! Incremental parser for HTTP/1.0 responses carrying streamed JSON.
//!
//! The server end of a REST channel speaks plain HTTP/1.0 with optional
//! keep-alive. Bodies are JSON, possibly several values back to back, and
//! possibly unterminated (no Content-Length, read until EOF). The parser
//! consumes bytes as they arrive and emits one reply per complete JSON
//! value, so long-poll endpoints stream without buffering.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Problem;
use crate::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body,
}

/// One reply produced while parsing a response.
#[derive(Debug)]
pub(crate) struct Reply {
    /// The parsed body value, `None` for the empty terminal reply.
    pub body: Option<Value>,
    /// Whether this reply finishes the response.
    pub complete: bool,
}

/// Parser for one HTTP response on a REST connection.
#[derive(Debug)]
pub(crate) struct ResponseParser {
    label: String,
    state: State,

    status: u16,
    message: String,

    /// Bytes of body left to read, or -1 to read until EOF.
    remaining: i64,
    skip_body: bool,
    keep_alive: bool,

    /// Plain-text error bodies accumulate here to replace vague status
    /// messages like "Internal Server Error".
    failure: Option<String>,

    replies: usize,
}

impl ResponseParser {
    pub(crate) fn new(label: &str) -> ResponseParser {
        ResponseParser {
            label: label.to_owned(),
            state: State::Head,
            status: 0,
            message: String::new(),
            remaining: -1,
            skip_body: false,
            keep_alive: false,
            failure: None,
            replies: 0,
        }
    }

    pub(crate) fn status(&self) -> u16 {
        self.status
    }

    /// The reply message: the collected plain-text failure body when there
    /// is one, the HTTP reason phrase otherwise.
    pub(crate) fn message(&self) -> &str {
        match self.failure {
            Some(ref failure) if !failure.is_empty() => failure,
            _ => &self.message,
        }
    }

    pub(crate) fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    /// Feeds buffered bytes through the parser.
    ///
    /// Consumed bytes are removed from `buffer`. Replies are appended to
    /// `replies`. Returns `Ok(true)` once the response is complete, and
    /// `Err` with the channel problem on a protocol violation.
    pub(crate) fn process(
        &mut self,
        buffer: &mut BytesMut,
        end_of_data: bool,
        replies: &mut Vec<Reply>,
    ) -> Result<bool, Problem> {
        if self.state == State::Head {
            if !self.parse_head(buffer, end_of_data)? {
                return Ok(false);
            }
        }

        let mut block = buffer.len();
        let mut end_of_data = end_of_data;
        if self.remaining >= 0 {
            // Never feed the parser bytes past the advertised length.
            if (self.remaining as usize) <= block {
                block = self.remaining as usize;
                end_of_data = true;
            }
        }

        let consumed = if self.skip_body {
            if let Some(ref mut failure) = self.failure {
                if let Ok(text) = std::str::from_utf8(&buffer[..block]) {
                    failure.push_str(text);
                }
            }
            block
        } else {
            self.parse_body(&buffer[..block], end_of_data, replies)?
        };
        buffer.advance(consumed);

        let done = if self.remaining < 0 {
            end_of_data && buffer.is_empty()
        } else {
            self.remaining -= consumed as i64;
            self.remaining == 0
        };

        // A skipped or empty body still produces its terminal reply.
        if done && self.replies == 0 {
            replies.push(Reply {
                body: None,
                complete: true,
            });
        }

        Ok(done)
    }

    fn parse_head(&mut self, buffer: &mut BytesMut, end_of_data: bool) -> Result<bool, Problem> {
        let mut header_buf = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut header_buf);

        let consumed = match response.parse(buffer) {
            Ok(httparse::Status::Complete(consumed)) => consumed,
            Ok(httparse::Status::Partial) => {
                if end_of_data {
                    warn!("{}: received truncated HTTP response", self.label);
                    return Err(Problem::ProtocolError);
                }
                return Ok(false);
            }
            Err(err) => {
                warn!(
                    "{}: received response with bad HTTP status line or headers: {}",
                    self.label, err
                );
                return Err(Problem::ProtocolError);
            }
        };

        self.status = response.code.unwrap_or(0);
        self.message = response.reason.unwrap_or("").to_owned();

        // Only HTTP/1.0 responses are expected; version 1.1 bodies cannot
        // be trusted here (chunking), so they are skipped.
        if response.version != Some(0) {
            if self.is_success() {
                warn!(
                    "{}: received response with unexpected HTTP version",
                    self.label
                );
            }
            self.skip_body = true;
        }

        let mut content_type: Option<String> = None;
        for header in response.headers.iter() {
            if header.name.eq_ignore_ascii_case("Content-Length") {
                let value = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<i64>().ok());
                match value {
                    Some(length) if length >= 0 => self.remaining = length,
                    _ => {
                        warn!(
                            "{}: received invalid Content-Length in response",
                            self.label
                        );
                        return Err(Problem::ProtocolError);
                    }
                }
            } else if header.name.eq_ignore_ascii_case("Content-Type") {
                content_type = std::str::from_utf8(header.value)
                    .ok()
                    .map(|v| v.trim().to_owned());
            } else if header.name.eq_ignore_ascii_case("Connection") {
                if let Ok(value) = std::str::from_utf8(header.value) {
                    if value.to_ascii_lowercase().contains("keep-alive") {
                        self.keep_alive = true;
                    }
                }
            }
        }

        let content_type = content_type.unwrap_or_else(|| {
            if self.is_success() {
                "application/json".to_owned()
            } else {
                "text/plain".to_owned()
            }
        });

        if !content_type.starts_with("text/json") && !content_type.starts_with("application/json") {
            self.skip_body = true;
        }

        // Plain-text errors carry a better message than the status line.
        if content_type.starts_with("text/plain") && !self.is_success() {
            self.failure = Some(String::new());
        }

        buffer.advance(consumed);
        self.state = State::Body;
        Ok(true)
    }

    fn parse_body(
        &mut self,
        data: &[u8],
        end_of_data: bool,
        replies: &mut Vec<Reply>,
    ) -> Result<usize, Problem> {
        let mut limit = data.len();
        let mut data = data;
        let mut total = 0;

        loop {
            if limit == 0 {
                return Ok(total);
            }

            let (spaces, mut block) = json::skip(data);
            if block == 0 {
                if end_of_data {
                    // Likely invalid JSON; let the parser report it.
                    block = limit;
                } else {
                    return Ok(total);
                }
            }

            limit -= block;
            total += block;

            if spaces != block {
                let value: Value = match serde_json::from_slice(&data[spaces..block]) {
                    Ok(value) => value,
                    Err(err) => {
                        debug!("{}", err);
                        warn!(
                            "{}: invalid JSON received in response to REST request",
                            self.label
                        );
                        return Err(Problem::ProtocolError);
                    }
                };
                replies.push(Reply {
                    body: Some(value),
                    complete: end_of_data && limit == 0,
                });
                self.replies += 1;
            }

            data = &data[block..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(parser: &mut ResponseParser, data: &[u8], eod: bool) -> (Vec<Reply>, bool) {
        let mut buffer = BytesMut::from(data);
        let mut replies = Vec::new();
        let done = parser.process(&mut buffer, eod, &mut replies).unwrap();
        (replies, done)
    }

    #[test]
    fn simple_response() {
        let mut parser = ResponseParser::new("test");
        let (replies, done) = feed(
            &mut parser,
            b"HTTP/1.0 200 OK\r\nContent-Length: 18\r\n\r\n{ \"key\": \"value\" }",
            false,
        );
        assert!(done);
        assert_eq!(parser.status(), 200);
        assert_eq!(parser.message(), "OK");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].complete);
        assert!(json::equal(
            replies[0].body.as_ref(),
            Some(&json!({ "key": "value" }))
        ));
    }

    #[test]
    fn stuttered_bytes() {
        let mut parser = ResponseParser::new("test");
        let full = b"HTTP/1.0 200 OK\r\nContent-Length: 11\r\n\r\n{\"key\": 42}";
        let mut buffer = BytesMut::new();
        let mut replies = Vec::new();
        for chunk in full.chunks(3) {
            buffer.extend_from_slice(chunk);
            if parser.process(&mut buffer, false, &mut replies).unwrap() {
                break;
            }
        }
        assert_eq!(replies.len(), 1);
        assert!(replies[0].complete);
    }

    #[test]
    fn zero_content_length() {
        let mut parser = ResponseParser::new("test");
        let (replies, done) = feed(&mut parser, b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", false);
        assert!(done);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.is_none());
        assert!(replies[0].complete);
    }

    #[test]
    fn absent_content_length_reads_to_eof() {
        let mut parser = ResponseParser::new("test");
        let (replies, done) = feed(&mut parser, b"HTTP/1.0 200 OK\r\n\r\n{\"a\": 1}", false);
        assert!(!done);
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].complete);

        let (replies, done) = feed(&mut parser, b"{\"b\": 2}", true);
        assert!(done);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].complete);
    }

    #[test]
    fn several_values_in_one_body() {
        let mut parser = ResponseParser::new("test");
        let (replies, done) = feed(
            &mut parser,
            b"HTTP/1.0 200 OK\r\nContent-Length: 17\r\n\r\n{\"a\": 1} {\"b\": 2}",
            false,
        );
        assert!(done);
        assert_eq!(replies.len(), 2);
        assert!(!replies[0].complete);
        assert!(replies[1].complete);
    }

    #[test]
    fn plain_text_failure_replaces_message() {
        let mut parser = ResponseParser::new("test");
        let head = b"HTTP/1.0 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nno such thing";
        let (replies, done) = feed(&mut parser, head, false);
        assert!(done);
        assert_eq!(parser.status(), 500);
        assert_eq!(parser.message(), "no such thing");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.is_none());
    }

    #[test]
    fn non_json_content_is_skipped() {
        let mut parser = ResponseParser::new("test");
        let (replies, done) = feed(
            &mut parser,
            b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: 6\r\n\r\n<html>",
            false,
        );
        assert!(done);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.is_none());
    }

    #[test]
    fn http_11_success_body_is_skipped() {
        let mut parser = ResponseParser::new("test");
        let (replies, done) = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}",
            false,
        );
        assert!(done);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.is_none());
    }

    #[test]
    fn invalid_json_is_protocol_error() {
        let mut parser = ResponseParser::new("test");
        let mut buffer = BytesMut::from(&b"HTTP/1.0 200 OK\r\nContent-Length: 4\r\n\r\n{,,}"[..]);
        let mut replies = Vec::new();
        assert_eq!(
            parser.process(&mut buffer, false, &mut replies).unwrap_err(),
            Problem::ProtocolError
        );
    }

    #[test]
    fn bad_content_length_is_protocol_error() {
        let mut parser = ResponseParser::new("test");
        let mut buffer = BytesMut::from(&b"HTTP/1.0 200 OK\r\nContent-Length: pony\r\n\r\n"[..]);
        let mut replies = Vec::new();
        assert!(parser.process(&mut buffer, false, &mut replies).is_err());
    }

    #[test]
    fn keep_alive_detected() {
        let mut parser = ResponseParser::new("test");
        feed(
            &mut parser,
            b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n",
            false,
        );
        assert!(parser.is_keep_alive());
    }
}
