//! A string intern table for paths, interface and property names.
//!
//! The cache hands these strings out as keys in emitted maps, so consumers
//! may keep the handles around for as long as the cache lives without
//! copying.

use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct Interner {
    table: HashSet<Arc<str>>,
}

impl Interner {
    pub(crate) fn new() -> Interner {
        Interner::default()
    }

    pub(crate) fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(interned) = self.table.get(s) {
            return interned.clone();
        }
        let interned: Arc<str> = Arc::from(s);
        self.table.insert(interned.clone());
        interned
    }
}
