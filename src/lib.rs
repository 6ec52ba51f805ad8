//! # EmberStore - Distributed Disk-Backed Key-Value Storage Engine
//!
//! EmberStore stores opaque byte values referenced by pre-hashed keys. It
//! can handle billions of keys (as memory allows) with full concurrent
//! access across many cores: all location information lives in a
//! concurrent in-memory index for speed, while values land in append-only
//! files on disk, buffered through in-memory pages first.
//!
//! ## Features
//!
//! - **Concurrent location index**: a lock-striped trie of hash leaves
//!   that splits and merges online, without global locks
//! - **Append-only value files**: checksummed framing, paired
//!   table-of-contents files, and full state recovery from the TOC
//!   directory alone
//! - **Anti-entropy replication**: interval-driven pull replication with
//!   rotating salted bloom-filter summaries and bulk-set responses
//! - **Timestamp conflict resolution**: higher timestamp wins; on an exact
//!   tie between a write and a delete, the delete wins
//! - **Background upkeep**: tombstone discard, file compaction and a disk
//!   watcher that gates writes on free space
//!
//! ## Keys and timestamps
//!
//! Keys are assumed pre-hashed and uniformly distributed: a 128-bit
//! (key_a, key_b) pair for [`ValueStore`], or a 256-bit parent-plus-name
//! quadruple for [`GroupStore`], which can additionally enumerate all
//! children under a parent.
//!
//! Each modification carries an `i64` timestamp of microseconds since the
//! Unix epoch, bounded by [`TIMESTAMP_MICRO_MIN`] and
//! [`TIMESTAMP_MICRO_MAX`]. Issuing a delete at a write's exact timestamp
//! deletes that specific write without fear of clobbering a newer one.
//!
//! ## Quick start
//!
//! ```no_run
//! use emberstore::{ValueKey, ValueStore};
//!
//! # fn main() -> emberstore::Result<()> {
//! let store = ValueStore::builder("/data/values", "/data/valuestoc").build()?;
//! store.enable_writes();
//!
//! let key = ValueKey::new(0xdead, 0xbeef);
//! store.write(&key, 1_000_000, b"a value")?;
//!
//! let mut value = Vec::new();
//! let timestamp = store.read(&key, &mut value)?;
//! assert_eq!(timestamp, 1_000_000);
//! assert_eq!(value, b"a value");
//!
//! store.flush();
//! # Ok(())
//! # }
//! ```
//!
//! ## Replication
//!
//! Cluster topology and transport stay outside this crate: provide a
//! [`ring::MsgRing`] implementation and the store will summarize each
//! owned partition into bloom filters on an interval, answer peer
//! summaries with bulk-sets of missing entries, and retire local copies
//! of handed-off data when acknowledged. Without a `MsgRing`, replication
//! is inert and the store runs standalone.

pub mod constants;
pub mod core;
pub mod error;
pub mod ring;
pub mod stats;
pub mod utils;

pub(crate) mod replication;
pub(crate) mod storage;

pub use crate::constants::{TIMESTAMP_MICRO_MAX, TIMESTAMP_MICRO_MIN};
pub use crate::core::key::{GroupKey, GroupedKey, StoreKey, ValueKey};
pub use crate::core::store::operations::{LookupGroupItem, ReadGroupItem};
pub use crate::core::store::{Store, StoreBuilder};
pub use crate::error::{EmberError, Result};
pub use crate::stats::{Statistics, StatsSnapshot};

/// Store keyed by 128-bit (key_a, key_b) pairs.
pub type ValueStore = Store<ValueKey>;

/// Store keyed by 256-bit (key_a, key_b, name_key_a, name_key_b)
/// quadruples, with enumeration of all names under a (key_a, key_b)
/// parent.
pub type GroupStore = Store<GroupKey>;

#[cfg(test)]
mod tests;
