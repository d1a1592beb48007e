//! Parent capability set and the in-memory root store.
//!
//! A session's parent is anything that can answer point lookups, absorb the
//! committed delta, and hand out key-ordered positional cursors. Two concrete
//! variants exist: [`Session`](crate::session::Session) (an in-memory layer)
//! and [`MemoryStore`] (the root a chain terminates in).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;

pub type Key = bytes::Bytes;
pub type Value = bytes::Bytes;

/// Where to position a [`StoreCursor`].
///
/// `Before` is the predecessor probe: `lower_bound(key)` stepped back one
/// entry, yielding the end sentinel when the lower bound is itself the first
/// entry or does not exist.
#[derive(Debug, Clone, Copy)]
pub enum Seek<'a> {
    First,
    End,
    Find(&'a Key),
    LowerBound(&'a Key),
    UpperBound(&'a Key),
    Before(&'a Key),
}

/// Positional, key-ordered cursor over a single store.
///
/// `key() == None` is the end sentinel. `step` moves forward one position;
/// a root-store cursor pins at end, a session cursor wraps around, so callers
/// scanning across sources detect wraparound by comparing keys.
pub trait StoreCursor {
    fn key(&self) -> Option<Key>;
    fn step(&mut self);
}

/// The capability set a session requires of its parent.
///
/// `read`/`write`/`erase` carry `anyhow::Result` so a fallible bottom store
/// propagates errors; the in-memory implementations never fail. `is_deleted`
/// asks whether an in-memory layer holds a tombstone for the key; root
/// stores always answer `false`.
pub trait KvStore {
    fn read(&self, key: &Key) -> anyhow::Result<Option<Value>>;
    fn contains(&self, key: &Key) -> anyhow::Result<bool>;
    fn is_deleted(&self, key: &Key) -> bool;

    fn write(&self, key: Key, value: Value) -> anyhow::Result<()>;
    fn write_batch(&self, pairs: Vec<(Key, Value)>) -> anyhow::Result<()>;
    fn erase(&self, key: &Key) -> anyhow::Result<()>;
    fn erase_batch(&self, keys: &[Key]) -> anyhow::Result<()>;

    fn cursor(&self, seek: Seek<'_>) -> Box<dyn StoreCursor + '_>;
    fn first_key(&self) -> Option<Key>;
    fn last_key(&self) -> Option<Key>;

    /// Bulk-copy the selected pairs into another store. Keys absent from the
    /// composed view are skipped.
    fn write_to(&self, other: &dyn KvStore, keys: &[Key]) -> anyhow::Result<()> {
        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.read(key)? {
                pairs.push((key.clone(), value));
            }
        }
        other.write_batch(pairs)
    }
}

pub(crate) fn seek_key<V>(map: &BTreeMap<Key, V>, seek: Seek<'_>) -> Option<Key> {
    match seek {
        Seek::First => map.keys().next().cloned(),
        Seek::End => None,
        Seek::Find(key) => map.get_key_value(key).map(|(key, _)| key.clone()),
        Seek::LowerBound(key) => map
            .range::<[u8], _>((Bound::Included(key.as_ref()), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone()),
        Seek::UpperBound(key) => key_after(map, key),
        Seek::Before(key) => {
            // No lower bound means no predecessor is reported, even when
            // smaller keys exist. Callers rely on this guard.
            map.range::<[u8], _>((Bound::Included(key.as_ref()), Bound::Unbounded))
                .next()?;
            map.range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_ref())))
                .next_back()
                .map(|(key, _)| key.clone())
        }
    }
}

pub(crate) fn key_after<V>(map: &BTreeMap<Key, V>, key: &Key) -> Option<Key> {
    map.range::<[u8], _>((Bound::Excluded(key.as_ref()), Bound::Unbounded))
        .next()
        .map(|(key, _)| key.clone())
}

/// Unbounded, ordered in-memory store: the persistent-tier stand-in a session
/// chain terminates in.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RefCell<BTreeMap<Key, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    /// Snapshot of the full contents in key order.
    pub fn to_pairs(&self) -> Vec<(Key, Value)> {
        self.map
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

struct MemoryCursor<'a> {
    store: &'a MemoryStore,
    pos: Option<Key>,
}

impl StoreCursor for MemoryCursor<'_> {
    fn key(&self) -> Option<Key> {
        self.pos.clone()
    }

    fn step(&mut self) {
        if let Some(current) = self.pos.take() {
            self.pos = key_after(&self.store.map.borrow(), &current);
        }
    }
}

impl KvStore for MemoryStore {
    fn read(&self, key: &Key) -> anyhow::Result<Option<Value>> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn contains(&self, key: &Key) -> anyhow::Result<bool> {
        Ok(self.map.borrow().contains_key(key))
    }

    fn is_deleted(&self, _key: &Key) -> bool {
        false
    }

    fn write(&self, key: Key, value: Value) -> anyhow::Result<()> {
        self.map.borrow_mut().insert(key, value);
        Ok(())
    }

    fn write_batch(&self, pairs: Vec<(Key, Value)>) -> anyhow::Result<()> {
        self.map.borrow_mut().extend(pairs);
        Ok(())
    }

    fn erase(&self, key: &Key) -> anyhow::Result<()> {
        self.map.borrow_mut().remove(key);
        Ok(())
    }

    fn erase_batch(&self, keys: &[Key]) -> anyhow::Result<()> {
        let mut map = self.map.borrow_mut();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn cursor(&self, seek: Seek<'_>) -> Box<dyn StoreCursor + '_> {
        let pos = seek_key(&self.map.borrow(), seek);
        Box::new(MemoryCursor { store: self, pos })
    }

    fn first_key(&self) -> Option<Key> {
        self.map.borrow().keys().next().cloned()
    }

    fn last_key(&self) -> Option<Key> {
        self.map.borrow().keys().next_back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Key {
        Key::copy_from_slice(s.as_bytes())
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .write_batch(vec![(b("b"), b("1")), (b("d"), b("2")), (b("f"), b("3"))])
            .unwrap();
        store
    }

    #[test]
    fn cursor_seek_positions() {
        let store = seeded();

        assert_eq!(store.cursor(Seek::First).key(), Some(b("b")));
        assert_eq!(store.cursor(Seek::End).key(), None);
        assert_eq!(store.cursor(Seek::Find(&b("d"))).key(), Some(b("d")));
        assert_eq!(store.cursor(Seek::Find(&b("c"))).key(), None);
        assert_eq!(store.cursor(Seek::LowerBound(&b("c"))).key(), Some(b("d")));
        assert_eq!(store.cursor(Seek::LowerBound(&b("d"))).key(), Some(b("d")));
        assert_eq!(store.cursor(Seek::UpperBound(&b("d"))).key(), Some(b("f")));
        assert_eq!(store.cursor(Seek::UpperBound(&b("f"))).key(), None);
    }

    #[test]
    fn before_guards_first_and_missing_lower_bound() {
        let store = seeded();

        assert_eq!(store.cursor(Seek::Before(&b("d"))).key(), Some(b("b")));
        assert_eq!(store.cursor(Seek::Before(&b("e"))).key(), Some(b("d")));
        // Lower bound is the first entry: no predecessor.
        assert_eq!(store.cursor(Seek::Before(&b("b"))).key(), None);
        assert_eq!(store.cursor(Seek::Before(&b("a"))).key(), None);
        // Everything sorts below the probe: lower bound absent, no predecessor.
        assert_eq!(store.cursor(Seek::Before(&b("z"))).key(), None);
    }

    #[test]
    fn cursor_steps_pin_at_end() {
        let store = seeded();
        let mut cursor = store.cursor(Seek::First);

        let mut seen = Vec::new();
        while let Some(key) = cursor.key() {
            seen.push(key);
            cursor.step();
        }
        assert_eq!(seen, vec![b("b"), b("d"), b("f")]);

        cursor.step();
        assert_eq!(cursor.key(), None);
    }

    #[test]
    fn write_to_copies_present_pairs() -> anyhow::Result<()> {
        let source = seeded();
        let target = MemoryStore::new();

        source.write_to(&target, &[b("b"), b("x"), b("f")])?;
        assert_eq!(target.to_pairs(), vec![(b("b"), b("1")), (b("f"), b("3"))]);
        Ok(())
    }
}
