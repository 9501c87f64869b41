//! Match rules deciding which paths and interfaces are being watched.
//!
//! These mirror what a message bus daemon does for AddMatch forwarding: an
//! ordered collection of `(path, namespace?, interface?, member?, arg0?)`
//! patterns with reference counts, so the same rule can be added and removed
//! symmetrically by independent consumers.
//!
//! A recompile step after each structural change precomputes fast paths: the
//! exact-path set, the namespace set, and three shortcut flags, so that the
//! common case of screening a signal by path costs one lookup.

use std::collections::HashSet;

use crate::paths::{self, PathSet};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    refs: usize,
    path: String,
    is_namespace: bool,
    interface: Option<String>,
    member: Option<String>,
    arg0: Option<String>,
}

impl Rule {
    fn is_same(&self, other: &Rule) -> bool {
        self.is_namespace == other.is_namespace
            && self.path == other.path
            && self.interface == other.interface
            && self.member == other.member
            && self.arg0 == other.arg0
    }

    fn matches(
        &self,
        path: &str,
        interface: Option<&str>,
        member: Option<&str>,
        arg0: Option<&str>,
    ) -> bool {
        if self.path != path {
            if !self.is_namespace || !paths::equal_or_ancestor(path, &self.path) {
                return false;
            }
        }
        if let (Some(interface), Some(rule_interface)) = (interface, self.interface.as_deref()) {
            if interface != rule_interface {
                return false;
            }
        }
        if let (Some(member), Some(rule_member)) = (member, self.member.as_deref()) {
            if member != rule_member {
                return false;
            }
        }
        // A rule with arg0 requires the message to actually carry one.
        if let Some(rule_arg0) = self.arg0.as_deref() {
            if arg0 != Some(rule_arg0) {
                return false;
            }
        }
        true
    }
}

/// A refcounted set of match rules with precompiled path screening.
///
/// An empty set matches nothing.
#[derive(Debug, Default)]
pub struct MatchRules {
    all: Vec<Rule>,
    exact_paths: HashSet<String>,
    path_namespaces: PathSet,
    all_paths: bool,
    only_paths: bool,
    nothing: bool,
}

impl MatchRules {
    /// Creates a set with no rules.
    pub fn new() -> MatchRules {
        MatchRules {
            nothing: true,
            ..MatchRules::default()
        }
    }

    /// Adds a rule. A missing path stands for the root namespace.
    ///
    /// Returns `true` if the rule was structurally inserted, `false` if an
    /// identical rule was present and only its refcount grew.
    pub fn add(
        &mut self,
        path: Option<&str>,
        is_namespace: bool,
        interface: Option<&str>,
        member: Option<&str>,
        arg0: Option<&str>,
    ) -> bool {
        let rule = normalize(path, is_namespace, interface, member, arg0);

        if let Some(existing) = self.all.iter_mut().find(|r| r.is_same(&rule)) {
            existing.refs += 1;
            return false;
        }

        self.all.push(rule);
        self.recompile();
        true
    }

    /// Removes one reference to a rule. Returns `true` if the rule was
    /// structurally removed.
    pub fn remove(
        &mut self,
        path: Option<&str>,
        is_namespace: bool,
        interface: Option<&str>,
        member: Option<&str>,
        arg0: Option<&str>,
    ) -> bool {
        if self.nothing {
            return false;
        }

        let rule = normalize(path, is_namespace, interface, member, arg0);
        let pos = match self.all.iter().position(|r| r.is_same(&rule)) {
            Some(pos) => pos,
            None => return false,
        };

        self.all[pos].refs -= 1;
        if self.all[pos].refs > 0 {
            return false;
        }

        self.all.remove(pos);
        self.recompile();
        true
    }

    /// Tests whether a signal or property described by the arguments is
    /// covered by any rule.
    pub fn matches(
        &self,
        path: &str,
        interface: Option<&str>,
        member: Option<&str>,
        arg0: Option<&str>,
    ) -> bool {
        if self.nothing {
            return false;
        }

        if !self.all_paths {
            if self.path_namespaces.contains_or_ancestor(path).is_none()
                && !self.exact_paths.contains(path)
            {
                return false;
            }
        }

        if self.only_paths {
            return true;
        }

        self.all
            .iter()
            .any(|rule| rule.matches(path, interface, member, arg0))
    }

    fn recompile(&mut self) {
        self.exact_paths.clear();
        self.path_namespaces = PathSet::new();
        self.all_paths = false;
        self.nothing = true;
        self.only_paths = true;

        for rule in &self.all {
            self.nothing = false;

            if rule.is_namespace {
                if rule.path == "/" {
                    self.all_paths = true;
                }
                self.path_namespaces.add(&rule.path);
            } else {
                self.exact_paths.insert(rule.path.clone());
            }

            if rule.interface.is_some() || rule.member.is_some() || rule.arg0.is_some() {
                self.only_paths = false;
            }
        }
    }
}

fn normalize(
    path: Option<&str>,
    is_namespace: bool,
    interface: Option<&str>,
    member: Option<&str>,
    arg0: Option<&str>,
) -> Rule {
    let (path, is_namespace) = match path {
        Some(path) => (path, is_namespace),
        None => ("/", true),
    };
    Rule {
        refs: 1,
        path: path.to_owned(),
        is_namespace,
        interface: interface.map(str::to_owned),
        member: member.map(str::to_owned),
        arg0: arg0.map(str::to_owned),
    }
}
