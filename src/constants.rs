use std::time::Duration;

// Size units
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

// Timestamp util bits. The high 56 bits of a stored timestamp carry
// microseconds since the Unix epoch; the low 8 bits are bookkeeping.
pub const TSB_UTIL_BITS: u32 = 8;

// The entry is a tombstone; no value bytes exist for it.
pub const TSB_DELETION: u64 = 0x80;

// The entry is queued for disappearance from the local index. Not a
// cluster-visible deletion.
pub const TSB_LOCAL_REMOVAL: u64 = 0x02;

// Scratch bit used while compaction rewrites an entry. The mem cleaner
// strips it before emitting on-disk TOC records; if it somehow ends up
// persisted anyway it is outside TSB_INACTIVE and therefore harmless.
pub const TSB_COMPACTION_REWRITE: u64 = 0x01;

// Any of these bits makes an entry invisible to reads.
pub const TSB_INACTIVE: u64 = 0xfe;

pub const TIMESTAMP_MICRO_MIN: i64 = 1 << TSB_UTIL_BITS;
pub const TIMESTAMP_MICRO_MAX: i64 = (u64::MAX >> TSB_UTIL_BITS) as i64;

// On-disk file framing
//    "VALUESTORE v0               ":28, checksum_interval:4
// or "VALUESTORETOC v0            ":28, checksum_interval:4
pub const FILE_HEADER_SIZE: usize = 32;

// "TERM v0 ":8
pub const VALUE_FILE_TRAILER_SIZE: usize = 8;

// 0:4 (reserved), offset-of-trailer:8, "TERM":4
pub const TOC_FILE_TRAILER_SIZE: usize = 16;

pub const CHECKSUM_SIZE: usize = 4;

// Store defaults
pub const DEFAULT_PAGE_SIZE: u32 = 4 * MB as u32;
pub const DEFAULT_VALUE_CAP: u32 = 4 * MB as u32;
pub const DEFAULT_FILE_CAP: u32 = u32::MAX;
pub const DEFAULT_CHECKSUM_INTERVAL: u32 = 65_532;
pub const DEFAULT_WRITE_PAGES_PER_WORKER: usize = 3;
pub const DEFAULT_RECOVERY_BATCH_SIZE: usize = 64 * 1024;

// Location map defaults
pub const DEFAULT_LOCMAP_PAGE_SIZE: usize = 512 * KB;
pub const DEFAULT_LOCMAP_SPLIT_MULTIPLIER: f64 = 3.0;

// Background defaults
pub const DEFAULT_TOMBSTONE_AGE: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_TOMBSTONE_DISCARD_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_REPLICATION_IGNORE_RECENT: Duration = Duration::from_secs(60);
pub const DEFAULT_OUT_PULL_REPLICATION_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.10;
pub const DEFAULT_COMPACTION_RETIREMENT_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_DISK_WATCHER_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DISK_FREE_DISABLE: f64 = 0.10;
pub const DEFAULT_DISK_FREE_ENABLE: f64 = 0.20;

// Replication defaults
pub const DEFAULT_BLOOM_N: u64 = 1_000_000;
pub const DEFAULT_BLOOM_P: f64 = 0.001;
pub const DEFAULT_IN_PULL_REPLICATION_MSGS: usize = 128;
pub const DEFAULT_OUT_PULL_REPLICATION_MSGS: usize = 128;
pub const DEFAULT_BULK_SET_MSG_CAP: usize = 16 * MB;
pub const DEFAULT_BULK_SET_ACK_MSG_CAP: usize = 64 * KB;
pub const DEFAULT_IN_BULK_SET_MSGS: usize = 128;
pub const DEFAULT_OUT_BULK_SET_MSGS: usize = 128;
pub const DEFAULT_IN_BULK_SET_ACK_MSGS: usize = 128;
pub const DEFAULT_OUT_BULK_SET_ACK_MSGS: usize = 128;
pub const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_millis(250);

// Pull-replication message header:
// node_id:8, ring_version:8, partition:4, cutoff:8, range_start:8, range_stop:8
pub const PULL_REPLICATION_MSG_HEADER_SIZE: usize = 44;

// Bloom filter serialization header: n:8, p:8 (f64 bits), salt:2, k:1
pub const BLOOM_FILTER_HEADER_SIZE: usize = 19;

// Bulk-set message header: ack-node-id:8
pub const BULK_SET_MSG_HEADER_SIZE: usize = 8;

// Per-entry fixed overhead past the key: timestamp:8, length:4
pub const BULK_SET_MSG_ENTRY_OVERHEAD: usize = 12;
