//! The shared inner store handed to replication workers and background
//! loops: the index, the block registry, and the internal entry points
//! around the write pipeline.

use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::constants::{TSB_DELETION, TSB_LOCAL_REMOVAL, TSB_UTIL_BITS};
use crate::core::key::StoreKey;
use crate::core::locmap::LocMap;
use crate::core::store::builder::Config;
use crate::core::store::mem_block::BlockRegistry;
use crate::core::store::pipeline::WriteReq;
use crate::error::{EmberError, Result};
use crate::ring::MsgRing;
use crate::stats::Statistics;
use crate::storage::file::StoreFile;

pub(crate) struct StoreCore<K: StoreKey> {
    pub cfg: Arc<Config>,
    pub locmap: Arc<LocMap<K>>,
    pub blocks: Arc<BlockRegistry<K>>,
    pub stats: Arc<Statistics>,
    pub files: Arc<Mutex<Vec<Arc<StoreFile<K>>>>>,
    pub active_file_id: Arc<AtomicU32>,
    pub write_txs: Vec<Sender<WriteReq<K>>>,
    pub flushed_rx: Mutex<Receiver<()>>,
    pub user_disabled: Mutex<bool>,
    pub shutdown: Arc<AtomicBool>,
}

impl<K: StoreKey> StoreCore<K> {
    pub fn msg_ring(&self) -> Option<&Arc<dyn MsgRing>> {
        self.cfg.msg_ring.as_ref()
    }

    /// Route a write to its shard and wait for the outcome. Returns the
    /// previously stored timestamp bits; the write took effect iff they
    /// are lower than `timestamp_bits`.
    pub fn write_inner(
        &self,
        key: &K,
        timestamp_bits: u64,
        value: Bytes,
        internal: bool,
    ) -> Result<u64> {
        let shard = ((key.key_a() >> 1) % self.write_txs.len() as u64) as usize;
        let (resp_tx, resp_rx) = bounded(1);
        self.write_txs[shard]
            .send(WriteReq::Write {
                key: *key,
                timestamp_bits,
                value,
                internal,
                resp: resp_tx,
            })
            .map_err(|_| EmberError::ShuttingDown)?;
        resp_rx.recv().map_err(|_| EmberError::ShuttingDown)?
    }

    /// Writes issued by replication, tombstone discard and compaction;
    /// accepted even while user writes are disabled.
    pub fn write_internal(&self, key: &K, timestamp_bits: u64, value: Bytes) -> Result<u64> {
        self.write_inner(key, timestamp_bits, value, true)
    }

    /// Location lookup without touching value bytes. Reports a tombstone
    /// as `NotFound` carrying the deletion's timestamp.
    pub fn lookup_inner(&self, key: &K) -> Result<(u64, u32)> {
        let loc = self.locmap.get(key);
        if loc.block_id == 0 || loc.timestamp & TSB_DELETION != 0 {
            return Err(EmberError::NotFound {
                timestamp_micro: (loc.timestamp >> TSB_UTIL_BITS) as i64,
            });
        }
        Ok((loc.timestamp, loc.length))
    }

    /// Resolve and fetch a key's value, appending it to `out`. Returns the
    /// timestamp bits and whether a value was appended; inactive and
    /// unknown keys report `(bits, false)` so callers can distinguish
    /// never-seen (bits 0), tombstones and local removals by the bits. A
    /// location pointing at a mem block the cleaner recycled mid-read is
    /// re-resolved once.
    pub fn read_raw(&self, key: &K, out: &mut Vec<u8>) -> Result<(u64, bool)> {
        for attempt in 0..2 {
            let loc = self.locmap.get(key);
            if loc.block_id == 0 || loc.timestamp & (TSB_DELETION | TSB_LOCAL_REMOVAL) != 0 {
                return Ok((loc.timestamp, false));
            }
            let Some(block) = self.blocks.get(loc.block_id) else {
                return Err(EmberError::Corrupt("unknown block id".to_string()));
            };
            match block.read(key, loc.timestamp, loc.offset, loc.length, out) {
                Ok(bits) => return Ok((bits, true)),
                Err(EmberError::NotFound { .. }) => return Ok((loc.timestamp, false)),
                Err(EmberError::Corrupt(_)) if attempt == 0 => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EmberError::Corrupt(
            "location kept moving during read".to_string(),
        ))
    }

    /// Ensure everything buffered at the time of the call reaches disk.
    pub fn flush(&self) {
        for tx in &self.write_txs {
            let _ = tx.send(WriteReq::Flush);
        }
        let flushed = self.flushed_rx.lock();
        let _ = flushed.recv();
    }

    pub fn enable_writes(&self, user_call: bool) {
        let mut user_disabled = self.user_disabled.lock();
        if user_call || !*user_disabled {
            *user_disabled = false;
            for tx in &self.write_txs {
                let _ = tx.send(WriteReq::Enable);
            }
        }
    }

    pub fn disable_writes(&self, user_call: bool) {
        let mut user_disabled = self.user_disabled.lock();
        if user_call {
            *user_disabled = true;
        }
        for tx in &self.write_txs {
            let _ = tx.send(WriteReq::Disable);
        }
    }
}
