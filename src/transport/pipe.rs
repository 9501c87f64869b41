//! Transports over spawned peer processes.
//!
//! The interesting part is translating how the child died into the problem
//! code consumers see. A peer that got SIGTERM simply `terminated`; the
//! well-known bridge programs exiting 127 means the bridge is not installed
//! on the other machine, which surfaces as `no-cockpit` so callers can offer
//! installation instead of a generic failure.
//!
//! The final `Closed` event is held back until the child has actually been
//! reaped: the stdio pair is dropped first, so a peer lingering after its
//! stdout closed still sees EOF and exits.

use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{Error, Problem};

use super::{Transport, TransportEvent, TransportHandle};

pin_project! {
    /// The stdio pair of a child process as one bidirectional stream.
    pub struct ChildStdio {
        #[pin]
        stdin: ChildStdin,
        #[pin]
        stdout: ChildStdout,
    }
}

impl std::fmt::Debug for ChildStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildStdio").finish()
    }
}

impl AsyncRead for ChildStdio {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().stdout.poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStdio {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().stdin.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().stdin.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().stdin.poll_shutdown(cx)
    }
}

/// A [`Transport`] talking to a spawned process over its stdio.
pub struct PipeTransport {
    inner: Option<Transport<ChildStdio>>,
    handle: TransportHandle,
    name: String,
    is_bridge: bool,
    reaping: Option<(Option<Problem>, BoxFuture<'static, std::io::Result<ExitStatus>>)>,
    finished: bool,
}

impl PipeTransport {
    /// Spawns `program` with piped stdio and frames messages over it.
    pub fn spawn(program: &str, args: &[&str]) -> Result<PipeTransport, Error> {
        let name = program.rsplit('/').next().unwrap_or(program);
        let is_bridge = well_known_bridge(name);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound && is_bridge {
                    warn!("{}: failed to execute bridge: not found", name);
                    Error::new_protocol(Problem::NoCockpit).with(err)
                } else {
                    debug!("{}: failed to run: {}", name, err);
                    Error::new_protocol(Problem::NotFound).with(err)
                }
            })?;

        let stdin = child.stdin.take().expect("child stdin was piped");
        let stdout = child.stdout.take().expect("child stdout was piped");
        let io = ChildStdio { stdin, stdout };
        let inner = Transport::new(io, name);
        let handle = inner.handle();

        Ok(PipeTransport {
            inner: Some(inner),
            handle,
            name: name.to_owned(),
            is_bridge,
            reaping: Some((None, Box::pin(async move { child.wait().await }))),
            finished: false,
        })
    }

    /// A clonable handle for queueing messages from elsewhere.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Queues a payload, like [`Transport::send`].
    pub fn send(&mut self, channel: Option<&str>, payload: bytes::Bytes) {
        if let Some(ref mut inner) = self.inner {
            inner.send(channel, payload);
        }
    }

    /// Starts buffering for a channel, like [`Transport::freeze`].
    pub fn freeze(&mut self, channel: &str) {
        if let Some(ref mut inner) = self.inner {
            inner.freeze(channel);
        }
    }

    /// Stops buffering for a channel, like [`Transport::thaw`].
    pub fn thaw(&mut self, channel: &str) {
        if let Some(ref mut inner) = self.inner {
            inner.thaw(channel);
        }
    }

    /// Closes the transport, like [`Transport::close`].
    pub fn close(&mut self, problem: Option<Problem>) {
        if let Some(ref mut inner) = self.inner {
            inner.close(problem);
        }
    }

    /// Drives the transport. The final `Closed` event carries a problem
    /// derived from how the child exited.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransportEvent>> {
        if let Some(ref mut inner) = self.inner {
            match inner.poll_event(cx) {
                Poll::Ready(Some(TransportEvent::Closed { problem })) => {
                    // Drop the stdio pair so the child sees EOF, then wait
                    // for it to be reaped before reporting closed.
                    self.inner = None;
                    if let Some((ref mut pending, _)) = self.reaping {
                        *pending = problem;
                    }
                }
                other => return other,
            }
        }

        if self.finished {
            return Poll::Ready(None);
        }

        match self.reaping {
            Some((ref problem, ref mut wait)) => match wait.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    let problem = match result {
                        Ok(status) => self.exit_problem(status, problem.clone()),
                        Err(err) => {
                            warn!("{}: couldn't wait for process: {}", self.name, err);
                            problem.clone().or(Some(Problem::InternalError))
                        }
                    };
                    self.reaping = None;
                    self.finished = true;
                    Poll::Ready(Some(TransportEvent::Closed { problem }))
                }
                Poll::Pending => Poll::Pending,
            },
            None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }

    fn exit_problem(&self, status: ExitStatus, problem: Option<Problem>) -> Option<Problem> {
        match problem {
            None | Some(Problem::InternalError) => {
                derive_exit_problem(status, &self.name, self.is_bridge).or(problem)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("name", &self.name)
            .finish()
    }
}

fn well_known_bridge(name: &str) -> bool {
    name == "cockpit-bridge" || name == "cockpit-session"
}

/// Derives the closed problem from a child's exit status.
pub(crate) fn derive_exit_problem(
    status: ExitStatus,
    name: &str,
    is_bridge: bool,
) -> Option<Problem> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGTERM is 15 everywhere this runs.
        if status.signal() == Some(15) {
            return Some(Problem::Terminated);
        }
    }

    match status.code() {
        Some(0) => None,
        Some(127) if is_bridge => Some(Problem::NoCockpit),
        Some(255) => Some(Problem::Terminated),
        _ => {
            if is_bridge {
                warn!("{}: bridge program failed: {}", name, status);
            } else {
                debug!("{}: process failed: {}", name, status);
            }
            Some(Problem::InternalError)
        }
    }
}
