//! Ordered iteration over the composed view.
//!
//! The session never materializes the full union of its chain. Instead it
//! grows an *iterator cache*: an ordered map of observed keys, each entry
//! recording whether the key's immediate neighbor in the composed view is
//! also interned, and whether the key is tombstoned. Cursors walk that map
//! and fall back to a neighbor probe whenever a flag says "unknown".
//!
//! The neighbor flags are conservative: `false` means "not known", never
//! "no such neighbor". Only `clear` removes entries, so a cursor's position
//! (an owned key) stays valid across interning.

use std::ops::Bound;

use crate::store::{Key, Seek, StoreCursor, Value};

use super::Session;

/// Per-key iterator cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterState {
    pub next_in_cache: bool,
    pub previous_in_cache: bool,
    pub deleted: bool,
}

/// How [`Session::update_iterator_cache`] treats an entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IterCacheParams {
    /// Only make sure the key is interned; skip all flag bookkeeping.
    pub prime_only: bool,
    /// Probe neighbors even when both flags are already known.
    pub recalculate: bool,
    /// The deleted bit to apply when overwriting.
    pub mark_deleted: bool,
    /// Authoritative update (write/erase) vs. observation (read-through),
    /// which must not disturb an existing deleted bit.
    pub overwrite: bool,
}

/// Which side wins when both the parent chain and the local cache produced a
/// candidate key.
#[derive(Debug, Clone, Copy)]
enum Winner<'a> {
    Least,
    /// Both sides located the probed key; either is correct, the local one
    /// is taken.
    Present,
    /// Predecessor probe: the true predecessor is the largest candidate
    /// still below the probe key. A survivor scan that skipped tombstones
    /// forward past the probe key loses to a side that stayed below it;
    /// with both sides past it, the smaller is kept.
    LargestBelow(&'a Key),
}

impl<'p> Session<'p> {
    /// Cursor at the smallest visible key, or at end if the composed view is
    /// empty.
    pub fn begin(&self) -> SessionIterator<'_, 'p> {
        self.make_iterator(Seek::First, Winner::Least, false, false)
    }

    /// The end sentinel cursor.
    pub fn end(&self) -> SessionIterator<'_, 'p> {
        SessionIterator {
            session: self,
            pos: None,
        }
    }

    /// Cursor at `key` if it is visible, else at end.
    pub fn find(&self, key: &Key) -> SessionIterator<'_, 'p> {
        self.make_iterator(Seek::Find(key), Winner::Present, true, false)
    }

    /// Cursor at the smallest visible key `>= key`.
    pub fn lower_bound(&self, key: &Key) -> SessionIterator<'_, 'p> {
        self.make_iterator(Seek::LowerBound(key), Winner::Least, false, false)
    }

    /// Cursor at the smallest visible key `> key`.
    pub fn upper_bound(&self, key: &Key) -> SessionIterator<'_, 'p> {
        self.make_iterator(Seek::UpperBound(key), Winner::Least, false, false)
    }

    pub(crate) fn composed_first_key(&self) -> Option<Key> {
        self.begin().pos
    }

    pub(crate) fn composed_last_key(&self) -> Option<Key> {
        let mut iterator = self.end();
        iterator.move_previous();
        iterator.pos
    }

    /// Build a cursor by scanning the parent chain and the local cache from
    /// the seek position, skipping keys this session considers deleted, and
    /// interning the winning key.
    ///
    /// `halt` stops a survivor scan after its first candidate (the `find` and
    /// predecessor constructions never walk forward past their target).
    /// `prime_only` is the bounds-probe mode: discovered keys are interned
    /// without flag bookkeeping.
    fn make_iterator(
        &self,
        seek: Seek<'_>,
        winner: Winner<'_>,
        halt: bool,
        prime_only: bool,
    ) -> SessionIterator<'_, 'p> {
        let parent_key = self.parent.get().and_then(|parent| {
            let mut cursor = parent.cursor(seek);
            self.scan_survivor(cursor.as_mut(), halt)
        });
        let local_key = {
            let mut cursor = CacheCursor::new(self, seek);
            self.scan_survivor(&mut cursor, halt)
        };

        let chosen = match (local_key, parent_key) {
            (local, None) => local,
            (None, parent) => parent,
            (Some(local), Some(parent)) => Some(match winner {
                Winner::Least => {
                    if local < parent {
                        local
                    } else {
                        parent
                    }
                }
                Winner::Present => local,
                Winner::LargestBelow(probe) => {
                    match (local < *probe, parent < *probe) {
                        (true, true) => {
                            if local > parent {
                                local
                            } else {
                                parent
                            }
                        }
                        (true, false) => local,
                        (false, true) => parent,
                        (false, false) => {
                            if local < parent {
                                local
                            } else {
                                parent
                            }
                        }
                    }
                }
            }),
        };

        let mut iterator = self.end();
        if let Some(key) = chosen {
            self.update_iterator_cache(
                &key,
                IterCacheParams {
                    prime_only,
                    recalculate: true,
                    mark_deleted: false,
                    overwrite: false,
                },
            );
            if !self.iter_state(&key).deleted {
                iterator.pos = Some(key);
            }
        }
        iterator
    }

    /// First key at or after the cursor that is not deleted in this session.
    ///
    /// A step that lands on a key not greater than the starting key means the
    /// underlying cursor wrapped around: the scan is exhausted.
    fn scan_survivor(&self, cursor: &mut dyn StoreCursor, halt: bool) -> Option<Key> {
        let origin = cursor.key()?;
        let mut pending = origin.clone();
        loop {
            if !self.is_deleted(&pending) {
                return Some(pending);
            }
            if halt {
                return None;
            }
            cursor.step();
            pending = cursor.key()?;
            if pending <= origin {
                return None;
            }
        }
    }

    /// Immediate predecessor and successor of `key` across the composed
    /// view. Runs the factory directly in prime-only mode rather than the
    /// public constructors, so probing never recurses into flag bookkeeping.
    /// A neighbor whose interned entry is tombstoned reports no bound.
    pub(crate) fn bounds(&self, key: &Key) -> (Option<Key>, Option<Key>) {
        let lower = self
            .make_iterator(Seek::Before(key), Winner::LargestBelow(key), false, true)
            .pos;
        let upper = self
            .make_iterator(Seek::UpperBound(key), Winner::Least, false, true)
            .pos;
        (lower, upper)
    }

    /// Intern `key` and maintain its entry per `params`, then record any
    /// discovered neighbors: a found bound is interned and the facing
    /// `next_in_cache`/`previous_in_cache` flags on both entries are set.
    pub(crate) fn update_iterator_cache(&self, key: &Key, params: IterCacheParams) {
        {
            let mut iter_cache = self.iter_cache.borrow_mut();
            let state = iter_cache.entry(key.clone()).or_default();
            if params.prime_only {
                return;
            }
            if params.overwrite {
                state.deleted = params.mark_deleted;
            }
            if !params.recalculate && state.next_in_cache && state.previous_in_cache {
                return;
            }
        }

        let (lower, upper) = self.bounds(key);

        let mut iter_cache = self.iter_cache.borrow_mut();
        if let Some(lower) = lower {
            iter_cache.entry(lower).or_default().next_in_cache = true;
            iter_cache.entry(key.clone()).or_default().previous_in_cache = true;
        }
        if let Some(upper) = upper {
            iter_cache.entry(upper).or_default().previous_in_cache = true;
            iter_cache.entry(key.clone()).or_default().next_in_cache = true;
        }
    }

    fn iter_state(&self, key: &Key) -> IterState {
        self.iter_cache
            .borrow()
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    fn iter_cache_first_key(&self) -> Option<Key> {
        self.iter_cache.borrow().keys().next().cloned()
    }

    fn iter_cache_last_key(&self) -> Option<Key> {
        self.iter_cache.borrow().keys().next_back().cloned()
    }

    fn iter_cache_key_after(&self, key: &Key) -> Option<Key> {
        self.iter_cache
            .borrow()
            .range::<[u8], _>((Bound::Excluded(key.as_ref()), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
    }

    fn iter_cache_key_before(&self, key: &Key) -> Option<Key> {
        self.iter_cache
            .borrow()
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_ref())))
            .next_back()
            .map(|(key, _)| key.clone())
    }
}

/// Bidirectional, cyclical cursor over a session's composed view.
///
/// The position is an owned key into the session's iterator cache (`None` is
/// the end sentinel), so interning new entries does not invalidate a live
/// cursor. Any non-cursor mutation of the session between cursor operations
/// is visible to the cursor on its next move.
#[derive(Clone)]
pub struct SessionIterator<'s, 'p> {
    session: &'s Session<'p>,
    pos: Option<Key>,
}

impl std::fmt::Debug for SessionIterator<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIterator")
            .field("pos", &self.pos)
            .finish()
    }
}

impl<'s, 'p> SessionIterator<'s, 'p> {
    pub fn is_end(&self) -> bool {
        self.pos.is_none()
    }

    pub fn key(&self) -> Option<&Key> {
        self.pos.as_ref()
    }

    /// Whether the current entry carries a tombstone. False at end.
    pub fn deleted(&self) -> bool {
        match &self.pos {
            Some(key) => self.session.iter_state(key).deleted,
            None => false,
        }
    }

    /// Value at the cursor, re-read through the session so it reflects the
    /// composed view. `None` at end.
    pub fn value(&self) -> anyhow::Result<Option<Value>> {
        match &self.pos {
            Some(key) => self.session.read(key),
            None => Ok(None),
        }
    }

    /// Current `(key, value)` pair, or `None` at end. The value side is
    /// `None` when the key has no visible value (a tombstoned entry).
    pub fn entry(&self) -> Option<anyhow::Result<(Key, Option<Value>)>> {
        let key = self.pos.clone()?;
        Some(self.session.read(&key).map(|value| (key, value)))
    }

    /// Advance to the next visible entry, re-probing neighbors on demand and
    /// skipping tombstones. Falling off the end rolls over to the first
    /// visible entry; with an exhausted view the cursor parks at end.
    pub fn move_next(&mut self) {
        loop {
            let Some(current) = self.pos.clone() else {
                break;
            };
            if !self.session.iter_state(&current).next_in_cache {
                self.session.update_iterator_cache(
                    &current,
                    IterCacheParams {
                        prime_only: false,
                        recalculate: true,
                        mark_deleted: false,
                        overwrite: false,
                    },
                );
                if !self.session.iter_state(&current).next_in_cache {
                    self.pos = None;
                    break;
                }
            }
            self.pos = self.session.iter_cache_key_after(&current);
            match &self.pos {
                None => break,
                Some(next) if !self.session.iter_state(next).deleted => break,
                Some(_) => {}
            }
        }
        if self.pos.is_none() {
            // Rollover: the first entry may itself be a bare tombstone, so
            // the wrapped-to position is subject to the same skip as a
            // forward step. An all-deleted cache parks the cursor at end.
            self.pos = self.session.iter_cache_first_key();
            while let Some(current) = self.pos.clone() {
                if !self.session.iter_state(&current).deleted {
                    break;
                }
                if !self.session.iter_state(&current).next_in_cache {
                    self.session.update_iterator_cache(
                        &current,
                        IterCacheParams {
                            prime_only: false,
                            recalculate: true,
                            mark_deleted: false,
                            overwrite: false,
                        },
                    );
                    if !self.session.iter_state(&current).next_in_cache {
                        self.pos = None;
                        break;
                    }
                }
                self.pos = self.session.iter_cache_key_after(&current);
            }
        }
    }

    /// Retreat to the previous visible entry. The wraparound applies first:
    /// at the first entry the cursor falls off to the end sentinel, and the
    /// step below lands on the last entry.
    pub fn move_previous(&mut self) {
        if self.pos.is_some() && self.pos == self.session.iter_cache_first_key() {
            self.pos = None;
        }
        loop {
            if let Some(current) = self.pos.clone() {
                if !self.session.iter_state(&current).previous_in_cache {
                    self.session.update_iterator_cache(
                        &current,
                        IterCacheParams {
                            prime_only: false,
                            recalculate: true,
                            mark_deleted: false,
                            overwrite: false,
                        },
                    );
                    if !self.session.iter_state(&current).previous_in_cache {
                        self.pos = None;
                        break;
                    }
                }
            }
            self.pos = match self.pos.take() {
                None => self.session.iter_cache_last_key(),
                Some(current) => self.session.iter_cache_key_before(&current),
            };
            match &self.pos {
                None => break,
                Some(previous) if !self.session.iter_state(previous).deleted => break,
                Some(_) => {}
            }
        }
    }
}

/// Equality is only meaningful between cursors of the same session: two end
/// cursors are equal, otherwise positions compare by key. Cursors of
/// different sessions are never equal.
impl PartialEq for SessionIterator<'_, '_> {
    fn eq(&self, other: &Self) -> bool {
        debug_assert!(
            std::ptr::eq(self.session, other.session),
            "comparing cursors from different sessions"
        );
        if !std::ptr::eq(self.session, other.session) {
            return false;
        }
        match (&self.pos, &other.pos) {
            (None, None) => true,
            (Some(left), Some(right)) => left == right,
            _ => false,
        }
    }
}

impl Eq for SessionIterator<'_, '_> {}

impl StoreCursor for SessionIterator<'_, '_> {
    fn key(&self) -> Option<Key> {
        self.pos.clone()
    }

    fn step(&mut self) {
        self.move_next();
    }
}

struct CacheCursor<'s, 'p> {
    session: &'s Session<'p>,
    pos: Option<Key>,
}

impl<'s, 'p> CacheCursor<'s, 'p> {
    fn new(session: &'s Session<'p>, seek: Seek<'_>) -> Self {
        let pos = session.cache.borrow().seek_key(seek);
        Self { session, pos }
    }
}

impl StoreCursor for CacheCursor<'_, '_> {
    fn key(&self) -> Option<Key> {
        self.pos.clone()
    }

    fn step(&mut self) {
        if let Some(current) = self.pos.take() {
            self.pos = self.session.cache.borrow().key_after(&current);
        }
    }
}
