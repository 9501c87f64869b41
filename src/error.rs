//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have gangway `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling bridge streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io,
    /// The transport, channel or connection has already closed.
    Closed,
    /// An engine shut down with a wire-visible problem code.
    Protocol(Problem),
    /// A message was sent in a state that does not allow it.
    InvalidState,
}

#[derive(Debug)]
pub(crate) enum Parse {
    /// Invalid decimal length prefix on a transport frame.
    FramePrefix,
    /// A control message that is not a JSON object, or has a bad
    /// `command`/`channel` member.
    Command,
    /// Invalid JSON payload.
    Json,
    /// Invalid HTTP head (status line or headers).
    Http,
    /// Text that was not valid UTF-8.
    Utf8,
}

/// A stable problem code, as carried in `close` messages on the wire.
///
/// These codes are part of the protocol and shared with every other
/// implementation of the bridge, so their string forms never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// The resource or address was not found.
    NotFound,
    /// Permission was denied by the remote.
    AccessDenied,
    /// The peer violated the protocol.
    ProtocolError,
    /// A programmer error or unexpected OS failure.
    InternalError,
    /// A capability or payload type is not supported here.
    NotSupported,
    /// The peer process was terminated.
    Terminated,
    /// The stream disconnected in the middle of the conversation.
    Disconnected,
    /// The well-known bridge program is not installed on the peer.
    NoCockpit,
    /// A problem code minted by a peer that this implementation does not
    /// recognize. Carried through verbatim.
    Other(String),
}

impl Problem {
    /// The wire form of the problem code.
    pub fn as_str(&self) -> &str {
        match *self {
            Problem::NotFound => "not-found",
            Problem::AccessDenied => "access-denied",
            Problem::ProtocolError => "protocol-error",
            Problem::InternalError => "internal-error",
            Problem::NotSupported => "not-supported",
            Problem::Terminated => "terminated",
            Problem::Disconnected => "disconnected",
            Problem::NoCockpit => "no-cockpit",
            Problem::Other(ref s) => s,
        }
    }
}

impl<'a> From<&'a str> for Problem {
    fn from(s: &'a str) -> Problem {
        match s {
            "not-found" => Problem::NotFound,
            "access-denied" => Problem::AccessDenied,
            "protocol-error" => Problem::ProtocolError,
            "internal-error" => Problem::InternalError,
            "not-supported" => Problem::NotSupported,
            "terminated" => Problem::Terminated,
            "disconnected" => Problem::Disconnected,
            "no-cockpit" => Problem::NoCockpit,
            other => Problem::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns true if this was a parse error of some wire content.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error came from reading or writing a stream.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the transport, channel or connection had closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns the wire problem code attached to this error, if any.
    pub fn problem(&self) -> Option<&Problem> {
        match self.inner.kind {
            Kind::Protocol(ref problem) => Some(problem),
            _ => None,
        }
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_protocol(problem: Problem) -> Error {
        Error::new(Kind::Protocol(problem))
    }

    pub(crate) fn new_invalid_state() -> Error {
        Error::new(Kind::InvalidState)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::FramePrefix) => "invalid frame length prefix",
            Kind::Parse(Parse::Command) => "invalid control message",
            Kind::Parse(Parse::Json) => "invalid JSON",
            Kind::Parse(Parse::Http) => "invalid HTTP head",
            Kind::Parse(Parse::Utf8) => "invalid UTF-8 text",
            Kind::Io => "stream error",
            Kind::Closed => "already closed",
            Kind::Protocol(_) => "closed with problem",
            Kind::InvalidState => "operation not valid in this state",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("gangway::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Protocol(ref problem) => {
                write!(f, "{}: {}", self.description(), problem.as_str())
            }
            _ => {
                if let Some(ref cause) = self.inner.cause {
                    write!(f, "{}: {}", self.description(), cause)
                } else {
                    f.write_str(self.description())
                }
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::new(Kind::Parse(Parse::Json)).with(err)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        Error::new(Kind::Parse(Parse::Http)).with(err)
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}
