//! The abstract remote API the property cache operates over.
//!
//! The actual DBus message codec lives elsewhere; the cache only needs the
//! four calls below plus the signals fed in through
//! [`DbusCache`](super::DbusCache) methods. Property values and dictionaries
//! are JSON values, the same representation the rest of the bridge speaks.

use futures_util::future::LocalBoxFuture;
use serde_json::{Map, Value};

/// An error reply from the remote.
#[derive(Debug, Clone)]
pub struct CallError {
    /// The remote error name, e.g. `org.freedesktop.DBus.Error.UnknownMethod`.
    pub name: String,
    /// The human readable message.
    pub message: String,
}

impl CallError {
    /// Builds an error from a remote error name and message.
    pub fn new(name: &str, message: &str) -> CallError {
        CallError {
            name: name.to_owned(),
            message: message.to_owned(),
        }
    }

    /// Errors that routinely happen while exploring a remote: asking about
    /// objects, interfaces or properties that are not there, or that we may
    /// not see. These get logged quietly; anything else is a warning.
    pub fn is_expected(&self) -> bool {
        matches!(
            self.name.as_str(),
            "org.freedesktop.DBus.Error.UnknownMethod"
                | "org.freedesktop.DBus.Error.UnknownObject"
                | "org.freedesktop.DBus.Error.UnknownInterface"
                | "org.freedesktop.DBus.Error.UnknownProperty"
                | "org.freedesktop.DBus.Error.AccessDenied"
                | "org.freedesktop.DBus.Error.Disconnected"
        )
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// One argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArgInfo {
    /// The argument name, when the remote bothered to provide one.
    pub name: Option<String>,
    /// The type signature.
    pub signature: String,
}

/// One method of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodInfo {
    /// The method name.
    pub name: String,
    /// Input arguments.
    pub in_args: Vec<ArgInfo>,
    /// Output arguments.
    pub out_args: Vec<ArgInfo>,
}

/// One signal of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalInfo {
    /// The signal name.
    pub name: String,
    /// The signal arguments.
    pub args: Vec<ArgInfo>,
}

/// How a property may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Readable and writable.
    ReadWrite,
}

impl Default for PropertyAccess {
    fn default() -> PropertyAccess {
        PropertyAccess::Read
    }
}

/// One property of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyInfo {
    /// The property name.
    pub name: String,
    /// The type signature.
    pub signature: String,
    /// How the property may be used.
    pub access: PropertyAccess,
}

/// The schema of one interface, as learned from introspection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceInfo {
    /// The interface name.
    pub name: String,
    /// The methods of the interface.
    pub methods: Vec<MethodInfo>,
    /// The properties of the interface.
    pub properties: Vec<PropertyInfo>,
    /// The signals of the interface.
    pub signals: Vec<SignalInfo>,
}

impl InterfaceInfo {
    /// An interface that is known by name only. Used when introspection
    /// failed but ordering guarantees still need a schema to refer to.
    pub fn named(name: &str) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_owned(),
            ..InterfaceInfo::default()
        }
    }
}

/// One node of the introspected object tree.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// Absolute or relative path of the node; `None` on the root node.
    pub path: Option<String>,
    /// Interfaces implemented at this node.
    pub interfaces: Vec<InterfaceInfo>,
    /// Child nodes.
    pub nodes: Vec<NodeInfo>,
}

/// A dictionary of property name to value.
pub type PropDict = Map<String, Value>;

/// The remote calls the cache needs.
///
/// Implementations wrap a real message bus connection; tests substitute a
/// scripted double. All calls resolve on the cache's task.
pub trait DbusClient {
    /// `org.freedesktop.DBus.Introspectable.Introspect`, parsed.
    fn introspect(&self, path: &str) -> LocalBoxFuture<'static, Result<NodeInfo, CallError>>;

    /// `org.freedesktop.DBus.Properties.GetAll`.
    fn get_all(
        &self,
        path: &str,
        interface: &str,
    ) -> LocalBoxFuture<'static, Result<PropDict, CallError>>;

    /// `org.freedesktop.DBus.Properties.Get`.
    fn get(
        &self,
        path: &str,
        interface: &str,
        property: &str,
    ) -> LocalBoxFuture<'static, Result<Value, CallError>>;

    /// `org.freedesktop.DBus.ObjectManager.GetManagedObjects`; the result
    /// maps path to interface to property dictionary.
    fn get_managed_objects(
        &self,
        path: &str,
    ) -> LocalBoxFuture<'static, Result<Map<String, Value>, CallError>>;
}

/// Is this a syntactically valid object path?
pub(crate) fn is_object_path(s: &str) -> bool {
    if s == "/" {
        return true;
    }
    if !s.starts_with('/') || s.ends_with('/') {
        return false;
    }
    s[1..].split('/').all(|element| {
        !element.is_empty()
            && element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_syntax() {
        assert!(is_object_path("/"));
        assert!(is_object_path("/otree"));
        assert!(is_object_path("/otree/frobber_2"));
        assert!(!is_object_path(""));
        assert!(!is_object_path("otree"));
        assert!(!is_object_path("/otree/"));
        assert!(!is_object_path("//otree"));
        assert!(!is_object_path("/otree frobber"));
        assert!(!is_object_path("/otree-frobber"));
    }

    #[test]
    fn expected_errors() {
        assert!(CallError::new("org.freedesktop.DBus.Error.UnknownMethod", "x").is_expected());
        assert!(CallError::new("org.freedesktop.DBus.Error.AccessDenied", "x").is_expected());
        assert!(!CallError::new("org.freedesktop.DBus.Error.NoReply", "x").is_expected());
    }
}
