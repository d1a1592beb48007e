//! Session-local key/value cache.
//!
//! Holds every pair written at this level plus values pulled down from the
//! parent on read-through. Ordered so the iterator factory can seek and step
//! it the same way it does the parent. Lookup counters are plain `Cell`s:
//! the owning session is single-threaded by design.

use std::cell::Cell;
use std::collections::BTreeMap;

use crate::store::{self, Key, KvStore, Seek, Value};

#[derive(Debug, Default)]
pub struct Cache {
    map: BTreeMap<Key, Value>,
    hits: Cell<u64>,
    misses: Cell<u64>,
    inserts: Cell<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub len: usize,
}

impl CacheStats {
    pub fn total_lookups(&self) -> u64 {
        self.hits.saturating_add(self.misses)
    }

    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.total_lookups();
        if total == 0 {
            return None;
        }
        Some(self.hits as f64 / total as f64)
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: &Key) -> Option<Value> {
        let value = self.map.get(key).cloned();
        if value.is_some() {
            self.hits.set(self.hits.get() + 1);
        } else {
            self.misses.set(self.misses.get() + 1);
        }
        value
    }

    pub fn write(&mut self, key: Key, value: Value) {
        self.map.insert(key, value);
        self.inserts.set(self.inserts.get() + 1);
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn erase(&mut self, key: &Key) {
        self.map.remove(key);
    }

    pub fn erase_batch<'a>(&mut self, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            self.map.remove(key);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.map.iter()
    }

    /// Batch-write the selected pairs into another store. Keys not cached at
    /// this level are skipped.
    pub fn write_to<'a>(
        &self,
        other: &dyn KvStore,
        keys: impl IntoIterator<Item = &'a Key>,
    ) -> anyhow::Result<()> {
        let mut pairs = Vec::new();
        for key in keys {
            if let Some(value) = self.map.get(key) {
                pairs.push((key.clone(), value.clone()));
            }
        }
        other.write_batch(pairs)
    }

    pub(crate) fn seek_key(&self, seek: Seek<'_>) -> Option<Key> {
        store::seek_key(&self.map, seek)
    }

    pub(crate) fn key_after(&self, key: &Key) -> Option<Key> {
        store::key_after(&self.map, key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            inserts: self.inserts.get(),
            len: self.map.len(),
        }
    }
}
