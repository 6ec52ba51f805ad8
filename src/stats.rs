use std::sync::atomic::{AtomicU64, Ordering};

/// Central statistics hub. Every counter is monotonic; `snapshot()` copies
/// them all at once.
#[derive(Debug, Default)]
pub struct Statistics {
    // Public API counters
    pub lookups: AtomicU64,
    pub lookup_errors: AtomicU64,
    pub lookup_groups: AtomicU64,
    pub lookup_group_items: AtomicU64,
    pub reads: AtomicU64,
    pub read_errors: AtomicU64,
    pub read_groups: AtomicU64,
    pub read_group_items: AtomicU64,
    pub writes: AtomicU64,
    pub write_errors: AtomicU64,
    pub writes_overridden: AtomicU64,
    pub deletes: AtomicU64,
    pub delete_errors: AtomicU64,
    pub deletes_overridden: AtomicU64,

    // Flush / recovery
    pub flushes: AtomicU64,
    pub from_disk_count: AtomicU64,

    // File integrity
    pub checksum_failures: AtomicU64,

    // Bulk-set
    pub out_bulk_sets: AtomicU64,
    pub out_bulk_set_values: AtomicU64,
    pub in_bulk_sets: AtomicU64,
    pub in_bulk_set_drops: AtomicU64,
    pub in_bulk_set_invalids: AtomicU64,
    pub in_bulk_set_writes: AtomicU64,
    pub in_bulk_set_write_errors: AtomicU64,
    pub in_bulk_set_writes_overridden: AtomicU64,

    // Bulk-set-ack
    pub out_bulk_set_acks: AtomicU64,
    pub in_bulk_set_acks: AtomicU64,
    pub in_bulk_set_ack_drops: AtomicU64,
    pub in_bulk_set_ack_invalids: AtomicU64,
    pub in_bulk_set_ack_writes: AtomicU64,
    pub in_bulk_set_ack_write_errors: AtomicU64,
    pub in_bulk_set_ack_writes_overridden: AtomicU64,

    // Pull replication
    pub out_pull_replications: AtomicU64,
    pub in_pull_replications: AtomicU64,
    pub in_pull_replication_drops: AtomicU64,
    pub in_pull_replication_invalids: AtomicU64,

    // Background loops
    pub expired_deletions: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_rewrites: AtomicU64,
    pub disk_watcher_disables: AtomicU64,
    pub disk_watcher_enables: AtomicU64,
}

/// A point-in-time copy of [`Statistics`], plus the location map's
/// out-of-place repair counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub lookups: u64,
    pub lookup_errors: u64,
    pub lookup_groups: u64,
    pub lookup_group_items: u64,
    pub reads: u64,
    pub read_errors: u64,
    pub read_groups: u64,
    pub read_group_items: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub writes_overridden: u64,
    pub deletes: u64,
    pub delete_errors: u64,
    pub deletes_overridden: u64,
    pub flushes: u64,
    pub from_disk_count: u64,
    pub checksum_failures: u64,
    pub out_bulk_sets: u64,
    pub out_bulk_set_values: u64,
    pub in_bulk_sets: u64,
    pub in_bulk_set_drops: u64,
    pub in_bulk_set_invalids: u64,
    pub in_bulk_set_writes: u64,
    pub in_bulk_set_write_errors: u64,
    pub in_bulk_set_writes_overridden: u64,
    pub out_bulk_set_acks: u64,
    pub in_bulk_set_acks: u64,
    pub in_bulk_set_ack_drops: u64,
    pub in_bulk_set_ack_invalids: u64,
    pub in_bulk_set_ack_writes: u64,
    pub in_bulk_set_ack_write_errors: u64,
    pub in_bulk_set_ack_writes_overridden: u64,
    pub out_pull_replications: u64,
    pub in_pull_replications: u64,
    pub in_pull_replication_drops: u64,
    pub in_pull_replication_invalids: u64,
    pub expired_deletions: u64,
    pub compactions: u64,
    pub compaction_rewrites: u64,
    pub disk_watcher_disables: u64,
    pub disk_watcher_enables: u64,
    pub out_of_place_key_detections: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            lookups: g(&self.lookups),
            lookup_errors: g(&self.lookup_errors),
            lookup_groups: g(&self.lookup_groups),
            lookup_group_items: g(&self.lookup_group_items),
            reads: g(&self.reads),
            read_errors: g(&self.read_errors),
            read_groups: g(&self.read_groups),
            read_group_items: g(&self.read_group_items),
            writes: g(&self.writes),
            write_errors: g(&self.write_errors),
            writes_overridden: g(&self.writes_overridden),
            deletes: g(&self.deletes),
            delete_errors: g(&self.delete_errors),
            deletes_overridden: g(&self.deletes_overridden),
            flushes: g(&self.flushes),
            from_disk_count: g(&self.from_disk_count),
            checksum_failures: g(&self.checksum_failures),
            out_bulk_sets: g(&self.out_bulk_sets),
            out_bulk_set_values: g(&self.out_bulk_set_values),
            in_bulk_sets: g(&self.in_bulk_sets),
            in_bulk_set_drops: g(&self.in_bulk_set_drops),
            in_bulk_set_invalids: g(&self.in_bulk_set_invalids),
            in_bulk_set_writes: g(&self.in_bulk_set_writes),
            in_bulk_set_write_errors: g(&self.in_bulk_set_write_errors),
            in_bulk_set_writes_overridden: g(&self.in_bulk_set_writes_overridden),
            out_bulk_set_acks: g(&self.out_bulk_set_acks),
            in_bulk_set_acks: g(&self.in_bulk_set_acks),
            in_bulk_set_ack_drops: g(&self.in_bulk_set_ack_drops),
            in_bulk_set_ack_invalids: g(&self.in_bulk_set_ack_invalids),
            in_bulk_set_ack_writes: g(&self.in_bulk_set_ack_writes),
            in_bulk_set_ack_write_errors: g(&self.in_bulk_set_ack_write_errors),
            in_bulk_set_ack_writes_overridden: g(&self.in_bulk_set_ack_writes_overridden),
            out_pull_replications: g(&self.out_pull_replications),
            in_pull_replications: g(&self.in_pull_replications),
            in_pull_replication_drops: g(&self.in_pull_replication_drops),
            in_pull_replication_invalids: g(&self.in_pull_replication_invalids),
            expired_deletions: g(&self.expired_deletions),
            compactions: g(&self.compactions),
            compaction_rewrites: g(&self.compaction_rewrites),
            disk_watcher_disables: g(&self.disk_watcher_disables),
            disk_watcher_enables: g(&self.disk_watcher_enables),
            out_of_place_key_detections: 0,
        }
    }
}
