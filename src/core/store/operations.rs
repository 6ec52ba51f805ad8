//! The public data path: lookup, read, write, delete, and the group
//! enumeration calls of the group variant.

use bytes::Bytes;

use crate::constants::{
    TIMESTAMP_MICRO_MAX, TIMESTAMP_MICRO_MIN, TSB_DELETION,
};
use crate::core::key::{GroupedKey, StoreKey};
use crate::core::store::Store;
use crate::core::timestamp::{bits_to_micro, micro_to_bits};
use crate::error::{EmberError, Result};
use crate::stats::Statistics;

/// One child under a group parent, as reported by `lookup_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupGroupItem {
    pub name_key_a: u64,
    pub name_key_b: u64,
    pub timestamp_micro: i64,
}

/// One child's data, as reported by `read_group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroupItem {
    pub name_key_a: u64,
    pub name_key_b: u64,
    pub timestamp_micro: i64,
    pub value: Vec<u8>,
}

impl<K: StoreKey> Store<K> {
    /// Returns `(timestamp_micro, length)` for the key.
    ///
    /// `NotFound` with `timestamp_micro() == 0` means the key was never
    /// known; non-zero means it was known and has a deletion marker.
    pub fn lookup(&self, key: &K) -> Result<(i64, u32)> {
        Statistics::incr(&self.core.stats.lookups);
        match self.core.lookup_inner(key) {
            Ok((timestamp_bits, length)) => Ok((bits_to_micro(timestamp_bits), length)),
            Err(e) => {
                Statistics::incr(&self.core.stats.lookup_errors);
                Err(e)
            }
        }
    }

    /// Appends the key's value to `value` and returns its
    /// `timestamp_micro`. The same `NotFound` convention as `lookup`
    /// applies.
    pub fn read(&self, key: &K, value: &mut Vec<u8>) -> Result<i64> {
        Statistics::incr(&self.core.stats.reads);
        match self.core.read_raw(key, value) {
            Ok((timestamp_bits, true)) => Ok(bits_to_micro(timestamp_bits)),
            Ok((timestamp_bits, false)) => {
                Statistics::incr(&self.core.stats.read_errors);
                Err(EmberError::NotFound {
                    timestamp_micro: bits_to_micro(timestamp_bits),
                })
            }
            Err(e) => {
                Statistics::incr(&self.core.stats.read_errors);
                Err(e)
            }
        }
    }

    /// Stores `value` at `timestamp_micro` and returns the previously
    /// stored timestamp. A newer timestamp already in place is not an
    /// error; the write is simply ignored (and counted as overridden).
    /// With a write and a delete at the exact same timestamp, the delete
    /// wins.
    pub fn write(&self, key: &K, timestamp_micro: i64, value: &[u8]) -> Result<i64> {
        Statistics::incr(&self.core.stats.writes);
        if !(TIMESTAMP_MICRO_MIN..=TIMESTAMP_MICRO_MAX).contains(&timestamp_micro) {
            Statistics::incr(&self.core.stats.write_errors);
            return Err(EmberError::TimestampOutOfRange(timestamp_micro));
        }
        match self.core.write_inner(
            key,
            micro_to_bits(timestamp_micro),
            Bytes::copy_from_slice(value),
            false,
        ) {
            Ok(prior_bits) => {
                let prior = bits_to_micro(prior_bits);
                if timestamp_micro <= prior {
                    Statistics::incr(&self.core.stats.writes_overridden);
                }
                Ok(prior)
            }
            Err(e) => {
                Statistics::incr(&self.core.stats.write_errors);
                Err(e)
            }
        }
    }

    /// Stores a deletion marker at `timestamp_micro` and returns the
    /// previously stored timestamp. Deletes are accepted even while user
    /// writes are disabled, so a full disk can still be drained.
    pub fn delete(&self, key: &K, timestamp_micro: i64) -> Result<i64> {
        Statistics::incr(&self.core.stats.deletes);
        if !(TIMESTAMP_MICRO_MIN..=TIMESTAMP_MICRO_MAX).contains(&timestamp_micro) {
            Statistics::incr(&self.core.stats.delete_errors);
            return Err(EmberError::TimestampOutOfRange(timestamp_micro));
        }
        let timestamp_bits = micro_to_bits(timestamp_micro) | TSB_DELETION;
        match self.core.write_inner(key, timestamp_bits, Bytes::new(), true) {
            Ok(prior_bits) => {
                let prior = bits_to_micro(prior_bits);
                if timestamp_micro <= prior {
                    Statistics::incr(&self.core.stats.deletes_overridden);
                }
                Ok(prior)
            }
            Err(e) => {
                Statistics::incr(&self.core.stats.delete_errors);
                Err(e)
            }
        }
    }
}

impl<K: GroupedKey> Store<K> {
    /// Returns every active `(name_key_a, name_key_b, timestamp)` child
    /// stored under the parent `(key_a, key_b)`, in no particular order.
    pub fn lookup_group(&self, key_a: u64, key_b: u64) -> Vec<LookupGroupItem> {
        Statistics::incr(&self.core.stats.lookup_groups);
        let items = self.core.locmap.get_group(key_a, key_b);
        Statistics::add(&self.core.stats.lookup_group_items, items.len() as u64);
        items
            .into_iter()
            .map(|(name_key_a, name_key_b, timestamp_bits)| LookupGroupItem {
                name_key_a,
                name_key_b,
                timestamp_micro: bits_to_micro(timestamp_bits),
            })
            .collect()
    }

    /// Returns every active child with its value. Children deleted between
    /// the enumeration and the read are skipped.
    pub fn read_group(&self, key_a: u64, key_b: u64) -> Vec<ReadGroupItem> {
        Statistics::incr(&self.core.stats.read_groups);
        let items = self.core.locmap.get_group(key_a, key_b);
        let mut out = Vec::with_capacity(items.len());
        for (name_key_a, name_key_b, _) in items {
            let key = K::from_parts(key_a, key_b, name_key_a, name_key_b);
            let mut value = Vec::new();
            if let Ok((timestamp_bits, true)) = self.core.read_raw(&key, &mut value) {
                out.push(ReadGroupItem {
                    name_key_a,
                    name_key_b,
                    timestamp_micro: bits_to_micro(timestamp_bits),
                    value,
                });
            }
        }
        Statistics::add(&self.core.stats.read_group_items, out.len() as u64);
        out
    }
}
