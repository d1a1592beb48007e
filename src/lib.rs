//! `sessiondb` is a layered, transactional key/value overlay: the in-memory
//! tier of a storage stack.
//!
//! A [`Session`] buffers writes, tombstones and cached reads above a parent,
//! which is either another session or a root store exposing the same
//! interface ([`KvStore`]). Sessions chain; clients observe the composed
//! view of the whole chain.
//!
//! - Point reads resolve delta-first and memoize parent hits (read-through).
//! - Deletes are tombstones that hide ancestor values.
//! - `commit` writes the delta through to the parent; `undo` drops it.
//!   Dropping an attached session commits.
//! - Iteration is key-ordered, bidirectional and cyclical, driven by an
//!   incrementally built iterator cache of observed keys and neighbor hints.
//!
//! A session is single-owner and not thread-shareable: logically-const reads
//! mutate the memoization structures behind cells.

pub mod cache;
pub mod session;
pub mod store;

pub use cache::{Cache, CacheStats};
pub use session::{IterState, Session, SessionIterator, SessionMetrics};
pub use store::{Key, KvStore, MemoryStore, Seek, StoreCursor, Value};
