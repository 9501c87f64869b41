#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # gangway
//!
//! gangway is the transport layer of a desktop-management bridge: it turns
//! one reliable byte stream into a multiplexed system of ordered,
//! back-pressured message channels, and ships the engines that the
//! interesting channels are built from.
//!
//! The pieces:
//!
//! - [`transport`]: the length-prefixed, channel-multiplexed message
//!   protocol carried over a socket pair, pipe, TLS connection or spawned
//!   process.
//! - [`channel`]: the lifecycle, flow control, freeze/thaw and close
//!   negotiation shared by every channel; payload types implement one
//!   trait.
//! - [`ws`]: an RFC 6455 WebSocket connection engine, serving as an
//!   alternative wire at the system boundary.
//! - [`rest`]: a channel multiplexing concurrent HTTP/1.0 requests with
//!   polling, watching and keep-alive.
//! - [`dbus`]: an ordered, batched cache of remote object properties with
//!   introspection and causal barriers.
//! - [`paths`], [`rules`], [`json`], [`flow`]: the small shared pieces the
//!   engines are made of.
//!
//! Everything runs single-threaded and cooperatively: engines are state
//! machines driven by `poll_*` methods from one task, and back pressure is
//! the universal substitute for blocking.

pub use crate::error::{Error, Problem, Result};

pub mod channel;
pub mod dbus;
mod error;
pub mod flow;
pub mod json;
pub mod paths;
pub mod rest;
pub mod rules;
pub mod transport;
pub mod ws;
