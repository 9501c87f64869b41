//! The REST-over-JSON channel (payload type `rest-json1`).
//!
//! Multiplexes many concurrent HTTP/1.0 requests onto one peer, addressed
//! by TCP port on localhost or by Unix socket. Each request is identified
//! by a caller-chosen integer cookie; reusing a cookie cancels whatever the
//! previous holder was doing, response and all.
//!
//! A request may poll: its response body is delivered only when it differs
//! from the previous one, on an interval timer and/or immediately whenever
//! another watched request sees response bytes. That is what turns a plain
//! HTTP endpoint into something a user interface can subscribe to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::{interval_at, Duration, Instant, Interval};
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelKind};
use crate::error::Problem;
use crate::json;
use crate::transport::io_problem;

mod parse;

use self::parse::{Reply, ResponseParser};

const READ_CHUNK: usize = 8 * 1024;

/// Where the HTTP peer lives.
#[derive(Debug, Clone)]
enum Address {
    Tcp(Vec<SocketAddr>),
    Unix(PathBuf),
}

enum HttpStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl HttpStream {
    fn poll_read_buf(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut BytesMut,
    ) -> Poll<std::io::Result<usize>> {
        buf.reserve(READ_CHUNK);
        match self {
            HttpStream::Tcp(io) => tokio_util::io::poll_read_buf(Pin::new(io), cx, buf),
            HttpStream::Unix(io) => tokio_util::io::poll_read_buf(Pin::new(io), cx, buf),
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        match self {
            HttpStream::Tcp(io) => Pin::new(io).poll_write(cx, data),
            HttpStream::Unix(io) => Pin::new(io).poll_write(cx, data),
        }
    }

    fn poll_eof(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        // Used on the idle keep-alive socket: any readiness there means the
        // server hung up (or broke protocol), either way it is useless now.
        let mut probe = [0u8; 1];
        let mut buf = ReadBuf::new(&mut probe);
        match self {
            HttpStream::Tcp(io) => match Pin::new(io).poll_read(cx, &mut buf) {
                Poll::Ready(_) => Poll::Ready(()),
                Poll::Pending => Poll::Pending,
            },
            HttpStream::Unix(io) => match Pin::new(io).poll_read(cx, &mut buf) {
                Poll::Ready(_) => Poll::Ready(()),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

enum ConnectState {
    Idle,
    Resolving(BoxFuture<'static, std::io::Result<Vec<SocketAddr>>>),
    Ready,
    Failed,
}

struct PollState {
    last: Option<Value>,
    interval: Option<Interval>,
    watching: i64,
    dirty: bool,
}

enum ResponseState {
    Connecting(BoxFuture<'static, std::io::Result<HttpStream>>),
    Active {
        io: HttpStream,
        out: BytesMut,
        buf: BytesMut,
        eof: bool,
    },
}

struct Response {
    state: ResponseState,
    parser: ResponseParser,
    /// Request bytes waiting for the connect to finish.
    pending: BytesMut,
}

struct Request {
    label: String,
    headers: Bytes,
    body: Option<Bytes>,
    poll: Option<PollState>,
    resp: Option<Response>,
}

/// The `rest-json1` channel implementation.
pub struct RestJson {
    name: String,
    connect: ConnectState,
    address: Option<Address>,
    requests: HashMap<i64, Request>,
    watches: HashMap<i64, Vec<i64>>,
    inactive: Option<HttpStream>,
    closed: bool,
}

impl RestJson {
    /// Creates the implementation; configuration comes from the open
    /// options during prepare.
    pub fn new() -> RestJson {
        RestJson {
            name: String::new(),
            connect: ConnectState::Idle,
            address: None,
            requests: HashMap::new(),
            watches: HashMap::new(),
            inactive: None,
            closed: false,
        }
    }

    fn watch_add(&mut self, watched: i64, watching: i64) {
        self.watches.entry(watched).or_default().push(watching);
    }

    fn watch_remove(&mut self, watched: i64, watching: i64) {
        if let Some(watchers) = self.watches.get_mut(&watched) {
            if let Some(pos) = watchers.iter().position(|w| *w == watching) {
                watchers.swap_remove(pos);
            }
            if watchers.is_empty() {
                self.watches.remove(&watched);
            }
        }
    }

    /// Marks every poll watching `watched` for immediate re-dispatch.
    fn watch_notify(&mut self, watched: i64) {
        let watchers = match self.watches.get(&watched) {
            Some(watchers) => watchers.clone(),
            None => return,
        };
        for watching in watchers {
            if let Some(req) = self.requests.get_mut(&watching) {
                if let Some(poll) = req.poll.as_mut() {
                    poll.dirty = true;
                }
            }
        }
    }

    fn remove_request(&mut self, cookie: i64) {
        if let Some(req) = self.requests.remove(&cookie) {
            if let Some(poll) = req.poll {
                if poll.watching != 0 {
                    self.watch_remove(poll.watching, cookie);
                }
            }
        }
    }

    fn destroy_poll(&mut self, cookie: i64) {
        let watching = match self.requests.get_mut(&cookie) {
            Some(req) => match req.poll.take() {
                Some(poll) => poll.watching,
                None => return,
            },
            None => return,
        };
        if watching != 0 {
            self.watch_remove(watching, cookie);
        }
    }

    fn dispatch(&mut self, cookie: i64) {
        let address = match self.address {
            Some(ref address) => address.clone(),
            None => return,
        };

        let inactive = self.inactive.take();
        let req = match self.requests.get_mut(&cookie) {
            Some(req) => req,
            None => {
                self.inactive = inactive;
                return;
            }
        };
        debug_assert!(req.resp.is_none());

        let mut out = BytesMut::with_capacity(req.headers.len());
        out.extend_from_slice(&req.headers);
        if let Some(ref body) = req.body {
            out.extend_from_slice(body);
        }

        let (state, pending) = match inactive {
            Some(io) => {
                trace!("{}: {}: reusing keep-alive connection", self.name, req.label);
                let state = ResponseState::Active {
                    io,
                    out,
                    buf: BytesMut::new(),
                    eof: false,
                };
                (state, BytesMut::new())
            }
            None => {
                let future: BoxFuture<'static, std::io::Result<HttpStream>> = match address {
                    Address::Tcp(addrs) => Box::pin(async move {
                        let io = TcpStream::connect(&addrs[..]).await?;
                        Ok(HttpStream::Tcp(io))
                    }),
                    Address::Unix(path) => Box::pin(async move {
                        let io = UnixStream::connect(path).await?;
                        Ok(HttpStream::Unix(io))
                    }),
                };
                (ResponseState::Connecting(future), out)
            }
        };

        req.resp = Some(Response {
            parser: ResponseParser::new(&req.label),
            state,
            pending,
        });
    }

    fn request_create(&mut self, chan: &mut Channel, options: &Map<String, Value>) {
        let invalid = |chan: &mut Channel, message: &str| {
            warn!("{}", message);
            chan.close(Some(Problem::ProtocolError));
        };

        let cookie = match json::get_int(options, "cookie", 0) {
            Ok(cookie) => cookie,
            Err(_) => return invalid(chan, "Invalid arguments in REST JSON request"),
        };
        let path = match json::get_str(options, "path") {
            Ok(path) => path.map(str::to_owned),
            Err(_) => return invalid(chan, "Invalid arguments in REST JSON request"),
        };
        let method = match json::get_str(options, "method") {
            Ok(method) => method.map(str::to_owned),
            Err(_) => return invalid(chan, "Invalid arguments in REST JSON request"),
        };

        let method = match method {
            None => {
                // Cancelling a finished or unknown request is not an error;
                // the caller may simply not have seen the completion yet.
                if self.requests.contains_key(&cookie) {
                    debug!("{}: request {} cancelled", self.name, cookie);
                    self.remove_request(cookie);
                } else {
                    debug!("{}: no request found when cancelling cookie {}", self.name, cookie);
                }
                return;
            }
            Some(method) => method,
        };

        let path = match path {
            None => return invalid(chan, "Missing \"path\" member in REST JSON request"),
            Some(path) => path,
        };
        if !path.starts_with('/') {
            return invalid(
                chan,
                "Invalid \"path\" member in REST JSON request: must start with a slash",
            );
        }
        if path.contains(|c: char| matches!(c, ' ' | '\r' | '\t' | '\n' | '\x0b')) {
            return invalid(
                chan,
                "Invalid \"path\" member in REST JSON request: contains spaces",
            );
        }

        if method.is_empty() || !method.bytes().all(is_token_char) {
            return invalid(
                chan,
                "Invalid \"method\" member in REST JSON request: contains bad chars",
            );
        }

        let mut poll_interval = 0i64;
        let mut poll_watch = 0i64;
        let poll_requested = match json::get_object(options, "poll") {
            Ok(Some(poll)) => {
                match json::get_int(poll, "interval", 1000) {
                    Ok(interval) if (0..i64::from(i32::MAX)).contains(&interval) => {
                        poll_interval = interval
                    }
                    _ => {
                        return invalid(
                            chan,
                            "Invalid \"interval\" member in REST JSON request: \
                             should be non-negative integer",
                        )
                    }
                }
                match json::get_int(poll, "watch", 0) {
                    Ok(watch) => poll_watch = watch,
                    Err(_) => {
                        return invalid(
                            chan,
                            "Invalid \"watch\" member in REST JSON request: \
                             should be non-negative integer",
                        )
                    }
                }
                true
            }
            Ok(None) => false,
            Err(_) => {
                return invalid(
                    chan,
                    "Invalid \"poll\" member in REST JSON request: should be object",
                )
            }
        };

        let body = options
            .get("body")
            .map(|body| Bytes::from(serde_json::to_vec(body).expect("JSON value serializes")));

        let mut headers = format!("{} {} HTTP/1.0\r\nConnection: keep-alive\r\n", method, path);
        if body.is_some() {
            headers.push_str("Content-Type: application/json\r\n");
        }
        headers.push_str(&format!(
            "Content-Length: {}\r\n\r\n",
            body.as_ref().map_or(0, Bytes::len)
        ));

        // Inserting cancels any previous request with this cookie,
        // including its in-flight response.
        self.remove_request(cookie);

        let poll = if poll_requested {
            if poll_watch != 0 {
                self.watch_add(poll_watch, cookie);
            }
            Some(PollState {
                last: None,
                interval: if poll_interval > 0 {
                    let period = Duration::from_millis(poll_interval as u64);
                    Some(interval_at(Instant::now() + period, period))
                } else {
                    None
                },
                watching: poll_watch,
                dirty: false,
            })
        } else {
            None
        };

        self.requests.insert(
            cookie,
            Request {
                label: path,
                headers: Bytes::from(headers),
                body,
                poll,
                resp: None,
            },
        );

        self.dispatch(cookie);
    }

    fn send_reply(&mut self, chan: &mut Channel, cookie: i64, reply: Reply) {
        let req = match self.requests.get_mut(&cookie) {
            Some(req) => req,
            None => return,
        };
        let resp = match req.resp.as_ref() {
            Some(resp) => resp,
            None => return,
        };

        let status = resp.parser.status();
        let message = resp.parser.message().to_owned();
        let success = (200..=299).contains(&status);
        let mut complete = reply.complete;
        let mut body = reply.body;
        let mut stop_poll = false;

        if let Some(poll) = req.poll.as_mut() {
            if success {
                let value = match body {
                    None => return, // no data, no reply
                    Some(value) => value,
                };
                if json::equal(poll.last.as_ref(), Some(&value)) {
                    return; // no change, no reply
                }
                debug!("{}: {}: poll found changed data, sending", self.name, req.label);
                poll.last = Some(value.clone());
                body = Some(value);
                complete = false;
            } else {
                debug!("{}: {}: poll failed, complete", self.name, req.label);
                stop_poll = true;
                complete = true;
                body = None;
            }
        } else {
            trace!(
                "{}: {}: sending {}response",
                self.name,
                req.label,
                if complete { "last " } else { "" }
            );
        }

        let mut object = Map::new();
        object.insert("cookie".into(), Value::from(cookie));
        object.insert("status".into(), Value::from(status));
        object.insert("message".into(), Value::String(message));
        if complete {
            object.insert("complete".into(), Value::Bool(true));
        }
        if let Some(body) = body {
            object.insert("body".into(), body);
        }

        let payload = serde_json::to_vec(&Value::Object(object)).expect("reply serializes");
        chan.send(Bytes::from(payload), true);

        if stop_poll {
            self.destroy_poll(cookie);
        }
    }

    fn drive_request(&mut self, chan: &mut Channel, cookie: i64, cx: &mut Context<'_>) {
        // Connect, write, read, parse; each stage may leave work pending.
        let req = match self.requests.get_mut(&cookie) {
            Some(req) => req,
            None => return,
        };

        let resp = match req.resp.as_mut() {
            Some(resp) => resp,
            None => return,
        };

        if let ResponseState::Connecting(ref mut future) = resp.state {
            match future.as_mut().poll(cx) {
                Poll::Ready(Ok(io)) => {
                    let out = std::mem::take(&mut resp.pending);
                    resp.state = ResponseState::Active {
                        io,
                        out,
                        buf: BytesMut::new(),
                        eof: false,
                    };
                }
                Poll::Ready(Err(err)) => {
                    warn!("{}: {}: connection failed: {}", self.name, req.label, err);
                    chan.close(Some(io_problem(&err)));
                    return;
                }
                Poll::Pending => return,
            }
        }

        let (mut got_bytes, mut saw_eof) = (false, false);
        if let ResponseState::Active {
            ref mut io,
            ref mut out,
            ref mut buf,
            ref mut eof,
        } = resp.state
        {
            while !out.is_empty() {
                match io.poll_write(cx, out) {
                    Poll::Ready(Ok(0)) => {
                        chan.close(Some(Problem::ProtocolError));
                        return;
                    }
                    Poll::Ready(Ok(n)) => out.advance(n),
                    Poll::Ready(Err(err)) => {
                        warn!("{}: {}: write failed: {}", self.name, req.label, err);
                        chan.close(Some(io_problem(&err)));
                        return;
                    }
                    Poll::Pending => break,
                }
            }

            loop {
                match io.poll_read_buf(cx, buf) {
                    Poll::Ready(Ok(0)) => {
                        *eof = true;
                        saw_eof = true;
                        break;
                    }
                    Poll::Ready(Ok(_)) => got_bytes = true,
                    Poll::Ready(Err(err)) => {
                        warn!("{}: {}: read failed: {}", self.name, req.label, err);
                        chan.close(Some(io_problem(&err)));
                        return;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if !got_bytes && !saw_eof {
            return;
        }

        // Any activity on a watched response pokes its watchers.
        self.watch_notify(cookie);

        let req = self.requests.get_mut(&cookie).expect("request still present");
        let resp = req.resp.as_mut().expect("response still present");

        let mut replies = Vec::new();
        let (done, keep_alive, reusable) = match resp.state {
            ResponseState::Active {
                ref mut buf, eof, ..
            } => {
                let done = match resp.parser.process(buf, eof, &mut replies) {
                    Ok(done) => done,
                    Err(problem) => {
                        chan.close(Some(problem));
                        return;
                    }
                };
                if !done && eof {
                    warn!(
                        "{}: {}: received truncated HTTP response",
                        self.name, req.label
                    );
                    chan.close(Some(Problem::ProtocolError));
                    return;
                }
                (done, resp.parser.is_keep_alive(), !eof)
            }
            ResponseState::Connecting(_) => (false, false, false),
        };

        for reply in replies {
            self.send_reply(chan, cookie, reply);
        }

        if done {
            let req = match self.requests.get_mut(&cookie) {
                Some(req) => req,
                None => return,
            };
            let resp = req.resp.take().expect("response still present");
            let is_poll = req.poll.is_some();

            if self.inactive.is_none() && keep_alive && reusable {
                if let ResponseState::Active { io, .. } = resp.state {
                    trace!("{}: keeping connection around due to keep-alive", self.name);
                    self.inactive = Some(io);
                }
            }

            if !is_poll {
                self.remove_request(cookie);
            }
        }
    }
}

impl Default for RestJson {
    fn default() -> RestJson {
        RestJson::new()
    }
}

impl ChannelKind for RestJson {
    fn prepare(&mut self, chan: &mut Channel) {
        let options = chan.options().clone();

        let port = json::get_int(&options, "port", -1).unwrap_or(-1);
        let unix = json::get_str(&options, "unix")
            .unwrap_or(None)
            .map(str::to_owned);

        match (port, unix) {
            (port, Some(_)) if port >= 0 => {
                chan.fail(Problem::ProtocolError, "cannot specify both port and unix options");
            }
            (port, None) if (0..65536).contains(&port) => {
                self.name = format!("localhost:{}", port);
                let port = port as u16;
                self.connect = ConnectState::Resolving(Box::pin(async move {
                    let addrs = tokio::net::lookup_host(("localhost", port)).await?;
                    Ok(addrs.collect())
                }));
            }
            (_, Some(path)) => {
                self.name = path.clone();
                self.address = Some(Address::Unix(PathBuf::from(path)));
                self.connect = ConnectState::Ready;
                chan.ready(None);
            }
            (port, None) if port >= 0 => {
                chan.fail(Problem::ProtocolError, "received invalid port option");
            }
            _ => {
                chan.fail(Problem::ProtocolError, "received neither a port or unix option");
            }
        }
    }

    fn recv(&mut self, chan: &mut Channel, payload: Bytes) {
        let options = match serde_json::from_slice::<Value>(&payload) {
            Ok(Value::Object(options)) => options,
            Ok(_) => {
                warn!("Received invalid REST JSON request: not an object");
                chan.close(Some(Problem::ProtocolError));
                return;
            }
            Err(err) => {
                warn!("Received invalid REST JSON request: {}", err);
                chan.close(Some(Problem::ProtocolError));
                return;
            }
        };
        self.request_create(chan, &options);
    }

    fn close(&mut self, _chan: &mut Channel, _problem: Option<&Problem>) {
        self.closed = true;
        self.requests.clear();
        self.watches.clear();
        self.inactive = None;
    }

    fn poll_drive(&mut self, chan: &mut Channel, cx: &mut Context<'_>) {
        if self.closed {
            return;
        }

        if let ConnectState::Resolving(ref mut future) = self.connect {
            match future.as_mut().poll(cx) {
                Poll::Ready(Ok(addrs)) if !addrs.is_empty() => {
                    self.address = Some(Address::Tcp(addrs));
                    self.connect = ConnectState::Ready;
                    chan.ready(None);
                }
                Poll::Ready(result) => {
                    match result {
                        Ok(_) => warn!("couldn't find address for {}", self.name),
                        Err(err) => {
                            warn!("couldn't find address for {}: {}", self.name, err)
                        }
                    }
                    self.connect = ConnectState::Failed;
                    chan.close(Some(Problem::NotFound));
                    return;
                }
                Poll::Pending => (),
            }
        }

        // Re-dispatch polls that are due, either by timer or because a
        // watched request saw traffic. In-flight responses take priority.
        let cookies: Vec<i64> = self.requests.keys().copied().collect();
        for cookie in &cookies {
            let req = match self.requests.get_mut(cookie) {
                Some(req) => req,
                None => continue,
            };
            if req.resp.is_some() {
                continue;
            }
            let due = match req.poll.as_mut() {
                Some(poll) => {
                    let mut due = std::mem::take(&mut poll.dirty);
                    if let Some(ref mut interval) = poll.interval {
                        while interval.poll_tick(cx).is_ready() {
                            due = true;
                        }
                    }
                    due
                }
                None => false,
            };
            if due {
                self.dispatch(*cookie);
            }
        }

        for cookie in cookies {
            self.drive_request(chan, cookie, cx);
        }

        // The spare keep-alive socket is dropped the moment the server
        // hangs up on it.
        if let Some(ref mut inactive) = self.inactive {
            if inactive.poll_eof(cx).is_ready() {
                debug!("{}: inactive connection closed", self.name);
                self.inactive = None;
            }
        }
    }
}

impl std::fmt::Debug for RestJson {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestJson")
            .field("name", &self.name)
            .field("requests", &self.requests.len())
            .finish()
    }
}

fn is_token_char(b: u8) -> bool {
    // The RFC 7230 token characters.
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' |
        b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}
