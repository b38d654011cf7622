//! Out-of-band metadata attached to constructed values
//!
//! Binding declarations may carry `metadata(key, value)` options. When the
//! runtime constructs the value, the accumulated entries land in this
//! side-table, keyed by the value's identity. The table is owned by one
//! compiled graph (not process-wide) so its lifetime matches the graph's.
//!
//! Entries are replaced whole, never partially mutated, so concurrent
//! readers and writers are safe behind the DashMap.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as Json;

use crate::value::Value;

/// One value's metadata: the ordered key/value pairs declared on its
/// binding.
#[derive(Debug, Clone, Default)]
pub struct MetaEntry {
    pub values: serde_json::Map<String, Json>,
}

impl MetaEntry {
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.values.get(key)
    }
}

/// Metadata side-table keyed by value identity.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entries: DashMap<usize, Arc<MetaEntry>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Attach (or replace) the metadata entry for a value.
    pub fn attach(&self, value: &Value, entry: MetaEntry) {
        self.entries.insert(value.identity(), Arc::new(entry));
    }

    /// Look up the metadata entry for a value, if any was attached.
    pub fn lookup(&self, value: &Value) -> Option<Arc<MetaEntry>> {
        self.entries.get(&value.identity()).map(|e| Arc::clone(&e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
