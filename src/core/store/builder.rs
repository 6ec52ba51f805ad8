use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::*;
use crate::core::key::StoreKey;
use crate::core::locmap::LocMapConfig;
use crate::core::store::{init, Store};
use crate::error::Result;
use crate::ring::MsgRing;

/// Resolved store configuration.
pub(crate) struct Config {
    pub path: PathBuf,
    pub path_toc: PathBuf,
    pub workers: usize,
    pub page_size: u32,
    pub value_cap: u32,
    pub file_cap: u32,
    pub file_readers: usize,
    pub checksum_interval: u32,
    pub min_value_alloc: u32,
    pub write_pages_per_worker: usize,
    pub recovery_batch_size: usize,
    pub locmap: LocMapConfig,
    pub tombstone_age: Duration,
    pub tombstone_discard_interval: Duration,
    pub replication_ignore_recent: Duration,
    pub out_pull_replication_interval: Duration,
    pub out_pull_replication_workers: usize,
    pub in_pull_replication_workers: usize,
    pub in_pull_replication_msgs: usize,
    pub out_pull_replication_msgs: usize,
    pub bloom_n: u64,
    pub bloom_p: f64,
    pub bulk_set_msg_cap: usize,
    pub in_bulk_set_workers: usize,
    pub in_bulk_set_msgs: usize,
    pub out_bulk_set_msgs: usize,
    pub bulk_set_ack_msg_cap: usize,
    pub in_bulk_set_ack_workers: usize,
    pub in_bulk_set_ack_msgs: usize,
    pub out_bulk_set_ack_msgs: usize,
    pub msg_timeout: Duration,
    pub compaction_interval: Duration,
    pub compaction_threshold: f64,
    pub compaction_retirement_grace: Duration,
    pub disk_watcher_interval: Duration,
    pub disk_free_disable: f64,
    pub disk_free_enable: f64,
    pub msg_ring: Option<Arc<dyn MsgRing>>,
}

impl Config {
    pub fn replication_ignore_recent_bits(&self) -> u64 {
        (self.replication_ignore_recent.as_micros() as u64) << TSB_UTIL_BITS
    }

    pub fn tombstone_age_bits(&self) -> u64 {
        (self.tombstone_age.as_micros() as u64) << TSB_UTIL_BITS
    }
}

/// Builder for configuring a store.
///
/// # Example
///
/// ```no_run
/// use emberstore::ValueStore;
///
/// # fn main() -> emberstore::Result<()> {
/// let store = ValueStore::builder("/data/values", "/data/valuestoc")
///     .workers(8)
///     .value_cap(1024 * 1024)
///     .build()?;
/// store.enable_writes();
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder<K: StoreKey> {
    path: PathBuf,
    path_toc: PathBuf,
    workers: Option<usize>,
    page_size: u32,
    value_cap: u32,
    file_cap: u32,
    file_readers: Option<usize>,
    checksum_interval: u32,
    write_pages_per_worker: usize,
    recovery_batch_size: usize,
    locmap_page_size: usize,
    locmap_split_multiplier: f64,
    tombstone_age: Duration,
    tombstone_discard_interval: Duration,
    replication_ignore_recent: Duration,
    out_pull_replication_interval: Duration,
    out_pull_replication_workers: Option<usize>,
    in_pull_replication_workers: Option<usize>,
    in_pull_replication_msgs: usize,
    out_pull_replication_msgs: usize,
    bloom_n: u64,
    bloom_p: f64,
    bulk_set_msg_cap: usize,
    in_bulk_set_workers: Option<usize>,
    in_bulk_set_msgs: usize,
    out_bulk_set_msgs: usize,
    bulk_set_ack_msg_cap: usize,
    in_bulk_set_ack_workers: Option<usize>,
    in_bulk_set_ack_msgs: usize,
    out_bulk_set_ack_msgs: usize,
    msg_timeout: Duration,
    compaction_interval: Duration,
    compaction_threshold: f64,
    compaction_retirement_grace: Duration,
    disk_watcher_interval: Duration,
    disk_free_disable: f64,
    disk_free_enable: f64,
    msg_ring: Option<Arc<dyn MsgRing>>,
    _key: PhantomData<K>,
}

impl<K: StoreKey> StoreBuilder<K> {
    pub(crate) fn new(path: impl Into<PathBuf>, path_toc: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            path_toc: path_toc.into(),
            workers: None,
            page_size: DEFAULT_PAGE_SIZE,
            value_cap: DEFAULT_VALUE_CAP,
            file_cap: DEFAULT_FILE_CAP,
            file_readers: None,
            checksum_interval: DEFAULT_CHECKSUM_INTERVAL,
            write_pages_per_worker: DEFAULT_WRITE_PAGES_PER_WORKER,
            recovery_batch_size: DEFAULT_RECOVERY_BATCH_SIZE,
            locmap_page_size: DEFAULT_LOCMAP_PAGE_SIZE,
            locmap_split_multiplier: DEFAULT_LOCMAP_SPLIT_MULTIPLIER,
            tombstone_age: DEFAULT_TOMBSTONE_AGE,
            tombstone_discard_interval: DEFAULT_TOMBSTONE_DISCARD_INTERVAL,
            replication_ignore_recent: DEFAULT_REPLICATION_IGNORE_RECENT,
            out_pull_replication_interval: DEFAULT_OUT_PULL_REPLICATION_INTERVAL,
            out_pull_replication_workers: None,
            in_pull_replication_workers: None,
            in_pull_replication_msgs: DEFAULT_IN_PULL_REPLICATION_MSGS,
            out_pull_replication_msgs: DEFAULT_OUT_PULL_REPLICATION_MSGS,
            bloom_n: DEFAULT_BLOOM_N,
            bloom_p: DEFAULT_BLOOM_P,
            bulk_set_msg_cap: DEFAULT_BULK_SET_MSG_CAP,
            in_bulk_set_workers: None,
            in_bulk_set_msgs: DEFAULT_IN_BULK_SET_MSGS,
            out_bulk_set_msgs: DEFAULT_OUT_BULK_SET_MSGS,
            bulk_set_ack_msg_cap: DEFAULT_BULK_SET_ACK_MSG_CAP,
            in_bulk_set_ack_workers: None,
            in_bulk_set_ack_msgs: DEFAULT_IN_BULK_SET_ACK_MSGS,
            out_bulk_set_ack_msgs: DEFAULT_OUT_BULK_SET_ACK_MSGS,
            msg_timeout: DEFAULT_MSG_TIMEOUT,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            compaction_retirement_grace: DEFAULT_COMPACTION_RETIREMENT_GRACE,
            disk_watcher_interval: DEFAULT_DISK_WATCHER_INTERVAL,
            disk_free_disable: DEFAULT_DISK_FREE_DISABLE,
            disk_free_enable: DEFAULT_DISK_FREE_ENABLE,
            msg_ring: None,
            _key: PhantomData,
        }
    }

    /// Number of write shards, mem cleaners and recovery workers.
    /// Default: the CPU count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Size of each in-memory write page. Default: 4 MiB.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes.max(K::TOC_ENTRY_SIZE as u32);
        self
    }

    /// Maximum accepted value length. Default: 4 MiB.
    pub fn value_cap(mut self, bytes: u32) -> Self {
        self.value_cap = bytes;
        self
    }

    /// Rotation threshold for value and TOC files. Default: 4 GiB.
    pub fn file_cap(mut self, bytes: u32) -> Self {
        self.file_cap = bytes.max(FILE_HEADER_SIZE as u32 * 2);
        self
    }

    /// Independent read handles per value file. Default: `workers`.
    pub fn file_readers(mut self, readers: usize) -> Self {
        self.file_readers = Some(readers.max(1));
        self
    }

    /// Payload bytes between checksums in value and TOC files.
    /// Default: 65,532.
    pub fn checksum_interval(mut self, bytes: u32) -> Self {
        self.checksum_interval = bytes.max(FILE_HEADER_SIZE as u32);
        self
    }

    /// Free mem pages per write shard. Default: 3.
    pub fn write_pages_per_worker(mut self, pages: usize) -> Self {
        self.write_pages_per_worker = pages.max(1);
        self
    }

    /// Entries per recovery batch. Default: 65,536.
    pub fn recovery_batch_size(mut self, entries: usize) -> Self {
        self.recovery_batch_size = entries.max(1);
        self
    }

    /// Bytes per location-map leaf page. Default: 512 KiB.
    pub fn locmap_page_size(mut self, bytes: usize) -> Self {
        self.locmap_page_size = bytes.max(1);
        self
    }

    /// How full a location-map leaf gets before splitting. Default: 3.0.
    pub fn locmap_split_multiplier(mut self, multiplier: f64) -> Self {
        self.locmap_split_multiplier = multiplier;
        self
    }

    /// How long tombstones are kept before discard. Should exceed several
    /// replication passes. Default: 4 hours.
    pub fn tombstone_age(mut self, age: Duration) -> Self {
        self.tombstone_age = age;
        self
    }

    pub fn tombstone_discard_interval(mut self, interval: Duration) -> Self {
        self.tombstone_discard_interval = interval;
        self
    }

    /// Recent writes left out of replication summaries. Default: 60s.
    pub fn replication_ignore_recent(mut self, age: Duration) -> Self {
        self.replication_ignore_recent = age;
        self
    }

    pub fn out_pull_replication_interval(mut self, interval: Duration) -> Self {
        self.out_pull_replication_interval = interval;
        self
    }

    pub fn out_pull_replication_workers(mut self, workers: usize) -> Self {
        self.out_pull_replication_workers = Some(workers.max(1));
        self
    }

    pub fn in_pull_replication_workers(mut self, workers: usize) -> Self {
        self.in_pull_replication_workers = Some(workers.max(1));
        self
    }

    pub fn in_pull_replication_msgs(mut self, msgs: usize) -> Self {
        self.in_pull_replication_msgs = msgs.max(1);
        self
    }

    pub fn out_pull_replication_msgs(mut self, msgs: usize) -> Self {
        self.out_pull_replication_msgs = msgs.max(1);
        self
    }

    /// Expected entries per replication bloom filter. Default: 1,000,000.
    pub fn bloom_n(mut self, n: u64) -> Self {
        self.bloom_n = n.max(1);
        self
    }

    /// Bloom filter false-positive rate. Default: 0.001.
    pub fn bloom_p(mut self, p: f64) -> Self {
        self.bloom_p = p;
        self
    }

    pub fn bulk_set_msg_cap(mut self, bytes: usize) -> Self {
        self.bulk_set_msg_cap = bytes.max(BULK_SET_MSG_HEADER_SIZE + 1);
        self
    }

    pub fn in_bulk_set_workers(mut self, workers: usize) -> Self {
        self.in_bulk_set_workers = Some(workers.max(1));
        self
    }

    pub fn in_bulk_set_msgs(mut self, msgs: usize) -> Self {
        self.in_bulk_set_msgs = msgs.max(1);
        self
    }

    pub fn out_bulk_set_msgs(mut self, msgs: usize) -> Self {
        self.out_bulk_set_msgs = msgs.max(1);
        self
    }

    pub fn bulk_set_ack_msg_cap(mut self, bytes: usize) -> Self {
        self.bulk_set_ack_msg_cap = bytes.max(K::ENCODED_LEN + 8);
        self
    }

    pub fn in_bulk_set_ack_workers(mut self, workers: usize) -> Self {
        self.in_bulk_set_ack_workers = Some(workers.max(1));
        self
    }

    pub fn in_bulk_set_ack_msgs(mut self, msgs: usize) -> Self {
        self.in_bulk_set_ack_msgs = msgs.max(1);
        self
    }

    pub fn out_bulk_set_ack_msgs(mut self, msgs: usize) -> Self {
        self.out_bulk_set_ack_msgs = msgs.max(1);
        self
    }

    /// Timeout for outbound sends and inbound pool waits. Default: 250ms.
    pub fn msg_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = timeout;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Live-entry fraction below which a file is compacted. Default: 0.10.
    pub fn compaction_threshold(mut self, threshold: f64) -> Self {
        self.compaction_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn compaction_retirement_grace(mut self, grace: Duration) -> Self {
        self.compaction_retirement_grace = grace;
        self
    }

    pub fn disk_watcher_interval(mut self, interval: Duration) -> Self {
        self.disk_watcher_interval = interval;
        self
    }

    /// Free-space fraction below which writes are disabled. Default: 0.10.
    pub fn disk_free_disable(mut self, fraction: f64) -> Self {
        self.disk_free_disable = fraction.clamp(0.0, 1.0);
        self
    }

    /// Free-space fraction above which writes re-enable. Default: 0.20.
    pub fn disk_free_enable(mut self, fraction: f64) -> Self {
        self.disk_free_enable = fraction.clamp(0.0, 1.0);
        self
    }

    /// The cluster transport; replication stays inert without one.
    pub fn msg_ring(mut self, msg_ring: Arc<dyn MsgRing>) -> Self {
        self.msg_ring = Some(msg_ring);
        self
    }

    /// Build the store; recovery replays the TOC directory before this
    /// returns. Writes start disabled until `enable_writes` is called.
    pub fn build(self) -> Result<Store<K>> {
        let workers = self.workers.unwrap_or_else(|| num_cpus::get().max(1));
        let entries_per_page = (self.page_size as usize / K::TOC_ENTRY_SIZE).max(1);
        // Keeps the values buffer from filling more than one checksum
        // interval ahead of the TOC buffer.
        let min_value_alloc = self.checksum_interval / entries_per_page as u32 + 1;
        let cfg = Config {
            path: self.path,
            path_toc: self.path_toc,
            workers,
            page_size: self.page_size,
            value_cap: self.value_cap.min(self.page_size),
            file_cap: self.file_cap,
            file_readers: self.file_readers.unwrap_or(workers),
            checksum_interval: self.checksum_interval,
            min_value_alloc,
            write_pages_per_worker: self.write_pages_per_worker,
            recovery_batch_size: self.recovery_batch_size,
            locmap: LocMapConfig {
                cores: num_cpus::get().max(1),
                page_size: self.locmap_page_size,
                split_multiplier: self.locmap_split_multiplier,
            },
            tombstone_age: self.tombstone_age,
            tombstone_discard_interval: self.tombstone_discard_interval,
            replication_ignore_recent: self.replication_ignore_recent,
            out_pull_replication_interval: self.out_pull_replication_interval,
            out_pull_replication_workers: self.out_pull_replication_workers.unwrap_or(workers),
            in_pull_replication_workers: self.in_pull_replication_workers.unwrap_or(workers),
            in_pull_replication_msgs: self.in_pull_replication_msgs,
            out_pull_replication_msgs: self.out_pull_replication_msgs,
            bloom_n: self.bloom_n,
            bloom_p: self.bloom_p,
            bulk_set_msg_cap: self.bulk_set_msg_cap,
            in_bulk_set_workers: self.in_bulk_set_workers.unwrap_or(workers),
            in_bulk_set_msgs: self.in_bulk_set_msgs,
            out_bulk_set_msgs: self.out_bulk_set_msgs,
            bulk_set_ack_msg_cap: self.bulk_set_ack_msg_cap,
            in_bulk_set_ack_workers: self.in_bulk_set_ack_workers.unwrap_or(workers),
            in_bulk_set_ack_msgs: self.in_bulk_set_ack_msgs,
            out_bulk_set_ack_msgs: self.out_bulk_set_ack_msgs,
            msg_timeout: self.msg_timeout,
            compaction_interval: self.compaction_interval,
            compaction_threshold: self.compaction_threshold,
            compaction_retirement_grace: self.compaction_retirement_grace,
            disk_watcher_interval: self.disk_watcher_interval,
            disk_free_disable: self.disk_free_disable,
            disk_free_enable: self.disk_free_enable,
            msg_ring: self.msg_ring,
        };
        init::open(cfg)
    }
}
