//! String interning for tag names and group names
//!
//! The same name/group strings recur across exports, selectors, and
//! consumer slots. Interning keeps one allocation per unique string and
//! makes tag comparison an `Arc` pointer check in the common case.
//! Uses DashMap for lock-free concurrent access.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

static INTERNER: Lazy<Interner> = Lazy::new(Interner::new);

/// Thread-safe string interner backed by DashMap.
pub struct Interner {
    strings: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self { strings: DashMap::new() }
    }

    /// Intern a string, returning a shared `Arc<str>`.
    pub fn intern(&self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing.key());
        }
        let key: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&key), ());
        key
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern through the process-wide interner.
pub fn intern(s: &str) -> Arc<str> {
    INTERNER.intern(s)
}
