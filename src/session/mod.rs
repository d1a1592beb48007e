//! Layered overlay sessions.
//!
//! A [`Session`] is a mutable delta stacked above a parent store: writes and
//! tombstones buffer locally, reads resolve against the composed view
//! (this delta over the parent chain) and memoize what they pull down.
//! `commit` writes the delta through to the parent; `undo` drops it.
//!
//! Reads are logically const but memoizing: they populate the local cache and
//! the iterator cache. All four per-session structures therefore live behind
//! cells, and the session is single-owner and not thread-shareable.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::cache::Cache;
use crate::store::{Key, KvStore, Seek, StoreCursor, Value};

mod iter;

pub use iter::{IterState, SessionIterator};

use iter::IterCacheParams;

/// Counter snapshot over the session's local structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub cached_entries: usize,
    pub updated_keys: usize,
    pub deleted_keys: usize,
    pub iterator_cache_entries: usize,
}

/// A buffered delta layer over an optional parent store.
///
/// The parent reference is non-owning; the caller keeps the parent alive for
/// the session's lifetime. Dropping an attached session commits its delta.
pub struct Session<'p> {
    parent: Cell<Option<&'p dyn KvStore>>,
    cache: RefCell<Cache>,
    updated: RefCell<FxHashSet<Key>>,
    deleted: RefCell<FxHashSet<Key>>,
    iter_cache: RefCell<BTreeMap<Key, IterState>>,
}

impl Default for Session<'_> {
    fn default() -> Self {
        Self {
            parent: Cell::new(None),
            cache: RefCell::new(Cache::new()),
            updated: RefCell::new(FxHashSet::default()),
            deleted: RefCell::new(FxHashSet::default()),
            iter_cache: RefCell::new(BTreeMap::new()),
        }
    }
}

impl<'p> Session<'p> {
    /// A detached session: usable for buffered operations, inert for commit.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: &'p dyn KvStore) -> Self {
        let session = Self::new();
        session.attach(parent);
        session
    }

    /// Set the parent and prime the iterator cache against it. Stale
    /// read-through entries from a previous parent are discarded.
    pub fn attach(&self, parent: &'p dyn KvStore) {
        self.parent.set(Some(parent));
        self.prime_cache();
    }

    /// Drop the parent reference. Nothing is flushed.
    pub fn detach(&self) {
        self.parent.set(None);
    }

    pub fn is_attached(&self) -> bool {
        self.parent.get().is_some()
    }

    /// Abandon the delta: detach and clear all local state.
    pub fn undo(&self) {
        tracing::debug!("undoing session delta");
        self.detach();
        self.clear();
    }

    /// Write the delta through to the parent, then clear local state.
    ///
    /// A detached session or an empty delta is a no-op. Tombstones are
    /// applied before the updated pairs; local state is cleared only after
    /// every parent call succeeded, so a failing parent leaves the delta
    /// intact.
    pub fn commit(&self) -> anyhow::Result<()> {
        let Some(parent) = self.parent.get() else {
            return Ok(());
        };
        if self.updated.borrow().is_empty() && self.deleted.borrow().is_empty() {
            return Ok(());
        }

        let deleted: Vec<Key> = self.deleted.borrow().iter().cloned().collect();
        tracing::debug!(
            updated = self.updated.borrow().len(),
            deleted = deleted.len(),
            "committing session delta to parent"
        );
        parent.erase_batch(&deleted)?;
        {
            let cache = self.cache.borrow();
            let updated = self.updated.borrow();
            cache.write_to(parent, updated.iter())?;
        }
        self.clear();
        Ok(())
    }

    /// Empty every local structure. The parent reference is untouched.
    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
        self.updated.borrow_mut().clear();
        self.deleted.borrow_mut().clear();
        self.iter_cache.borrow_mut().clear();
    }

    /// Value visible through the composed view, or `None`.
    ///
    /// A hit below this level is memoized into the local cache (the key is
    /// not marked updated) and interned into the iterator cache. No local
    /// mutation happens if the parent read fails.
    pub fn read(&self, key: &Key) -> anyhow::Result<Option<Value>> {
        if self.deleted.borrow().contains(key) {
            return Ok(None);
        }
        if let Some(value) = self.cache.borrow().read(key) {
            return Ok(Some(value));
        }
        let Some(parent) = self.parent.get() else {
            return Ok(None);
        };
        let Some(value) = parent.read(key)? else {
            return Ok(None);
        };

        self.cache.borrow_mut().write(key.clone(), value.clone());
        self.update_iterator_cache(
            key,
            IterCacheParams {
                prime_only: false,
                recalculate: true,
                mark_deleted: false,
                overwrite: false,
            },
        );
        Ok(Some(value))
    }

    pub fn write(&self, key: Key, value: Value) -> anyhow::Result<()> {
        self.updated.borrow_mut().insert(key.clone());
        self.deleted.borrow_mut().remove(&key);
        self.cache.borrow_mut().write(key.clone(), value);
        self.update_iterator_cache(
            &key,
            IterCacheParams {
                prime_only: false,
                recalculate: true,
                mark_deleted: false,
                overwrite: true,
            },
        );
        Ok(())
    }

    /// Record a tombstone for `key`, hiding any ancestor value.
    pub fn erase(&self, key: &Key) -> anyhow::Result<()> {
        self.deleted.borrow_mut().insert(key.clone());
        self.updated.borrow_mut().remove(key);
        self.cache.borrow_mut().erase(key);
        self.update_iterator_cache(
            key,
            IterCacheParams {
                prime_only: false,
                recalculate: true,
                mark_deleted: true,
                overwrite: true,
            },
        );
        Ok(())
    }

    pub fn contains(&self, key: &Key) -> anyhow::Result<bool> {
        if self.deleted.borrow().contains(key) {
            return Ok(false);
        }
        if self.cache.borrow().contains(key) {
            return Ok(true);
        }
        let Some(parent) = self.parent.get() else {
            return Ok(false);
        };
        if parent.contains(key)? {
            // The deleted bit is left alone here: a true bit implies the key
            // is in this session's deleted set, which returned above.
            self.update_iterator_cache(
                key,
                IterCacheParams {
                    prime_only: false,
                    recalculate: true,
                    mark_deleted: false,
                    overwrite: false,
                },
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether `key` is tombstoned at this level or, failing a local verdict,
    /// anywhere up the chain. A locally updated key is never deleted.
    pub fn is_deleted(&self, key: &Key) -> bool {
        if self.deleted.borrow().contains(key) {
            return true;
        }
        if self.updated.borrow().contains(key) {
            return false;
        }
        match self.parent.get() {
            Some(parent) => parent.is_deleted(key),
            None => false,
        }
    }

    /// Element-wise batch read: the pairs found and the set of keys with no
    /// visible value.
    pub fn read_batch(&self, keys: &[Key]) -> anyhow::Result<(Vec<(Key, Value)>, FxHashSet<Key>)> {
        let mut found = Vec::new();
        let mut not_found = FxHashSet::default();
        for key in keys {
            match self.read(key)? {
                Some(value) => found.push((key.clone(), value)),
                None => {
                    not_found.insert(key.clone());
                }
            }
        }
        Ok((found, not_found))
    }

    pub fn write_batch(&self, pairs: Vec<(Key, Value)>) -> anyhow::Result<()> {
        for (key, value) in pairs {
            self.write(key, value)?;
        }
        Ok(())
    }

    pub fn erase_batch(&self, keys: &[Key]) -> anyhow::Result<()> {
        for key in keys {
            self.erase(key)?;
        }
        Ok(())
    }

    /// Read the selected keys through this session and batch-write the pairs
    /// found into `other`.
    pub fn write_to(&self, other: &dyn KvStore, keys: &[Key]) -> anyhow::Result<()> {
        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.read(key)? {
                pairs.push((key.clone(), value));
            }
        }
        other.write_batch(pairs)
    }

    /// Pull the selected keys from `other` into this session as writes.
    pub fn read_from(&self, other: &dyn KvStore, keys: &[Key]) -> anyhow::Result<()> {
        other.write_to(self, keys)
    }

    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            cached_entries: self.cache.borrow().len(),
            updated_keys: self.updated.borrow().len(),
            deleted_keys: self.deleted.borrow().len(),
            iterator_cache_entries: self.iter_cache.borrow().len(),
        }
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.borrow().stats()
    }

    /// Reset the iterator cache against the current parent: drop every
    /// non-updated cache entry (stale read-throughs) and intern the parent's
    /// first and last keys. An empty parent primes nothing.
    fn prime_cache(&self) {
        self.iter_cache.borrow_mut().clear();

        let stale: Vec<Key> = {
            let cache = self.cache.borrow();
            let updated = self.updated.borrow();
            cache
                .iter()
                .map(|(key, _)| key)
                .filter(|key| !updated.contains(*key))
                .cloned()
                .collect()
        };
        if !stale.is_empty() {
            self.cache.borrow_mut().erase_batch(&stale);
        }

        let Some(parent) = self.parent.get() else {
            return;
        };
        let first = parent.first_key();
        let last = parent.last_key();
        let mut iter_cache = self.iter_cache.borrow_mut();
        if let Some(first) = first {
            iter_cache.entry(first).or_default();
        }
        if let Some(last) = last {
            iter_cache.entry(last).or_default();
        }
        tracing::trace!(
            entries = iter_cache.len(),
            "primed iterator cache from parent"
        );
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("attached", &self.is_attached())
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.commit() {
            tracing::warn!("commit during session drop failed: {err:#}");
        }
        self.undo();
    }
}

impl KvStore for Session<'_> {
    fn read(&self, key: &Key) -> anyhow::Result<Option<Value>> {
        Session::read(self, key)
    }

    fn contains(&self, key: &Key) -> anyhow::Result<bool> {
        Session::contains(self, key)
    }

    fn is_deleted(&self, key: &Key) -> bool {
        Session::is_deleted(self, key)
    }

    fn write(&self, key: Key, value: Value) -> anyhow::Result<()> {
        Session::write(self, key, value)
    }

    fn write_batch(&self, pairs: Vec<(Key, Value)>) -> anyhow::Result<()> {
        Session::write_batch(self, pairs)
    }

    fn erase(&self, key: &Key) -> anyhow::Result<()> {
        Session::erase(self, key)
    }

    fn erase_batch(&self, keys: &[Key]) -> anyhow::Result<()> {
        Session::erase_batch(self, keys)
    }

    fn cursor(&self, seek: Seek<'_>) -> Box<dyn StoreCursor + '_> {
        let iterator = match seek {
            Seek::First => self.begin(),
            Seek::End => self.end(),
            Seek::Find(key) => self.find(key),
            Seek::LowerBound(key) => self.lower_bound(key),
            Seek::UpperBound(key) => self.upper_bound(key),
            Seek::Before(key) => {
                let mut iterator = self.lower_bound(key);
                if iterator.is_end() || iterator == self.begin() {
                    self.end()
                } else {
                    iterator.move_previous();
                    iterator
                }
            }
        };
        Box::new(iterator)
    }

    fn first_key(&self) -> Option<Key> {
        self.composed_first_key()
    }

    fn last_key(&self) -> Option<Key> {
        self.composed_last_key()
    }

    fn write_to(&self, other: &dyn KvStore, keys: &[Key]) -> anyhow::Result<()> {
        Session::write_to(self, other, keys)
    }
}
