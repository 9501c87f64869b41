//! Mirroring remote objects: the property cache and its remote interface.
//!
//! [`DbusCache`] keeps an ordered, causally consistent local copy of the
//! properties of whatever remote objects the match rules cover. It talks to
//! the remote through the [`DbusClient`] trait, so the actual message bus
//! plumbing stays outside this crate and tests can script the remote.

mod cache;
mod connection;
mod intern;

pub use self::cache::{DbusCache, MetaHandler, PropMap, UpdateHandler, UpdateMap};
pub use self::connection::{
    ArgInfo, CallError, DbusClient, InterfaceInfo, MethodInfo, NodeInfo, PropDict, PropertyAccess,
    PropertyInfo, SignalInfo,
};
