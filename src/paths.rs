//! Sets of normalized absolute object paths.
//!
//! Paths begin with `/` and only the root ends in one. The set answers
//! ancestor and descendant queries with ordered lookups: descendants of a
//! path sort as a contiguous range right after its `"<path>/"` prefix, and
//! ancestors are found by truncating at `/` and probing each level.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

/// Does `path` sit directly under `parent`?
pub fn has_parent(path: &str, parent: &str) -> bool {
    let last = if parent == "/" && path.len() > 1 {
        &path[1..]
    } else if path.starts_with(parent) && path[parent.len()..].starts_with('/') {
        &path[parent.len() + 1..]
    } else {
        return false;
    };

    !last.is_empty() && !last.contains('/')
}

/// Is `path` equal to `ancestor`, or anywhere below it?
pub fn equal_or_ancestor(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Is `path` strictly below `ancestor`?
pub fn has_ancestor(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// An ordered set of object paths supporting ancestor/descendant queries.
///
/// Stored paths are handed out as shared `Arc<str>` handles so callers can
/// key other tables off them for as long as the set entry lives.
#[derive(Debug, Default)]
pub struct PathSet {
    tree: BTreeSet<Arc<str>>,
}

impl PathSet {
    /// Creates an empty set.
    pub fn new() -> PathSet {
        PathSet::default()
    }

    /// Adds a path, returning the interned handle if it was not present.
    pub fn add(&mut self, path: &str) -> Option<Arc<str>> {
        if self.tree.contains(path) {
            return None;
        }
        let interned: Arc<str> = Arc::from(path);
        self.tree.insert(interned.clone());
        Some(interned)
    }

    /// Removes a path. Returns whether it was present.
    pub fn remove(&mut self, path: &str) -> bool {
        self.tree.remove(path)
    }

    /// Returns whether `path` is present in the set.
    pub fn contains(&self, path: &str) -> bool {
        self.tree.contains(path)
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Is `path` in the set, or any path below it?
    pub fn contains_or_descendant(&self, path: &str) -> bool {
        if self.tree.contains(path) {
            return true;
        }

        let mut prefix = String::with_capacity(path.len() + 1);
        prefix.push_str(path);
        if path != "/" {
            prefix.push('/');
        }

        match self
            .tree
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .next()
        {
            Some(entry) => entry.starts_with(prefix.as_str()),
            None => false,
        }
    }

    /// Is `path` in the set, or any of its ancestors? Returns the interned
    /// handle of the closest match.
    pub fn contains_or_ancestor(&self, path: &str) -> Option<Arc<str>> {
        let mut probe = path;
        loop {
            if let Some(found) = self.tree.get(probe) {
                return Some(found.clone());
            }
            if probe == "/" {
                return None;
            }
            probe = match probe.rfind('/') {
                Some(0) => "/",
                Some(pos) => &probe[..pos],
                None => return None,
            };
        }
    }
}
