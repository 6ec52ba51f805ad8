//! In-memory write pages and the process-wide block registry.
//!
//! Both mem blocks and on-disk value files occupy the same 32-bit id space;
//! a location's `block_id` is only meaningful through the registry, so
//! callers never branch on the id value itself. Ids are never recycled and
//! id 0 is reserved to mean "no location".

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{TSB_DELETION, TSB_UTIL_BITS};
use crate::core::key::StoreKey;
use crate::error::{EmberError, Result};

/// Anything a location's `block_id` can resolve to: an in-memory page or an
/// on-disk value file.
pub(crate) trait LocBlock<K: StoreKey>: Send + Sync {
    /// Nanosecond name of the backing value file; mem blocks report
    /// `i64::MAX` since they have no file of their own yet.
    fn timestamp_nano(&self) -> i64;

    /// Append the value bytes at `(offset, length)` to `out`, returning the
    /// timestamp bits.
    fn read(
        &self,
        key: &K,
        timestamp_bits: u64,
        offset: u32,
        length: u32,
        out: &mut Vec<u8>,
    ) -> Result<u64>;
}

/// Append-only concurrent registry mapping block ids to blocks.
pub(crate) struct BlockRegistry<K: StoreKey> {
    blocks: RwLock<Vec<Option<Arc<dyn LocBlock<K>>>>>,
}

impl<K: StoreKey> BlockRegistry<K> {
    pub fn new() -> Self {
        Self {
            // Slot 0 stays empty: block id 0 means "no location".
            blocks: RwLock::new(vec![None]),
        }
    }

    pub fn add(&self, block: Arc<dyn LocBlock<K>>) -> Result<u32> {
        let mut blocks = self.blocks.write();
        if blocks.len() >= u32::MAX as usize {
            return Err(EmberError::BlockIdsExhausted);
        }
        let id = blocks.len() as u32;
        blocks.push(Some(block));
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<dyn LocBlock<K>>> {
        self.blocks.read().get(id as usize).cloned().flatten()
    }
}

#[derive(Default)]
pub(crate) struct MemBlockInner {
    pub file_id: u32,
    pub file_offset: u32,
    pub toc: Vec<u8>,
    pub values: Vec<u8>,
}

/// A pair of byte buffers accumulating writes before they reach a value
/// file. The owning write shard appends; once handed down the pipeline the
/// file writer records where the bytes landed and the cleaner re-points the
/// index and recycles the block. The inner lock is the discard interlock: a
/// reader resolving a location to a mem block holds it shared so the
/// cleaner cannot truncate the buffer mid-read.
pub(crate) struct MemBlock<K: StoreKey> {
    id: AtomicU32,
    pub(crate) inner: RwLock<MemBlockInner>,
    _key: std::marker::PhantomData<K>,
}

impl<K: StoreKey> MemBlock<K> {
    /// Create a block with `page_size`-capacity buffers and register it.
    pub fn register(registry: &BlockRegistry<K>, page_size: u32) -> Result<Arc<Self>> {
        let block = Arc::new(Self {
            id: AtomicU32::new(0),
            inner: RwLock::new(MemBlockInner {
                file_id: 0,
                file_offset: 0,
                toc: Vec::with_capacity(page_size as usize),
                values: Vec::with_capacity(page_size as usize),
            }),
            _key: std::marker::PhantomData,
        });
        let id = registry.add(block.clone())?;
        block.id.store(id, Ordering::Release);
        Ok(block)
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }
}

impl<K: StoreKey> LocBlock<K> for MemBlock<K> {
    fn timestamp_nano(&self) -> i64 {
        i64::MAX
    }

    fn read(
        &self,
        _key: &K,
        timestamp_bits: u64,
        offset: u32,
        length: u32,
        out: &mut Vec<u8>,
    ) -> Result<u64> {
        if timestamp_bits & TSB_DELETION != 0 {
            return Err(EmberError::NotFound {
                timestamp_micro: (timestamp_bits >> TSB_UTIL_BITS) as i64,
            });
        }
        let inner = self.inner.read();
        let start = offset as usize;
        let end = start + length as usize;
        if end > inner.values.len() {
            // The cleaner migrated and recycled this block after the caller
            // resolved its location; a fresh index lookup will land on the
            // file copy.
            return Err(EmberError::Corrupt("stale mem block location".to_string()));
        }
        out.extend_from_slice(&inner.values[start..end]);
        Ok(timestamp_bits)
    }
}
