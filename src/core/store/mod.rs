use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::core::background::{notify, BgAction, BgNotification};
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::replication::bulk_set::BulkSetState;
use crate::replication::bulk_set_ack::BulkSetAckState;
use crate::replication::pull::PullState;
use crate::stats::StatsSnapshot;

pub use self::builder::StoreBuilder;

pub mod builder;
pub(crate) mod init;
pub(crate) mod internal;
pub(crate) mod mem_block;
pub mod operations;
pub(crate) mod pipeline;
pub(crate) mod recovery;

/// Disk-backed store for opaque byte values referenced by pre-hashed keys,
/// with optional peer-to-peer anti-entropy replication.
///
/// The store buffers writes across many background threads; call `flush`
/// before relying on durability and `disable_all` before process exit to
/// wind the background work down. Writes start disabled; call
/// `enable_writes` (or `enable_all`) after construction.
pub struct Store<K: StoreKey> {
    pub(crate) core: Arc<StoreCore<K>>,
    pub(crate) pull: Option<Arc<PullState<K>>>,
    pub(crate) bulk_set: Option<Arc<BulkSetState<K>>>,
    pub(crate) bulk_set_ack: Option<Arc<BulkSetAckState<K>>>,
    pub(crate) tombstone_notify_tx: Sender<BgNotification>,
    pub(crate) tombstone_abort: Arc<AtomicBool>,
    pub(crate) compaction_notify_tx: Sender<BgNotification>,
    pub(crate) compaction_abort: Arc<AtomicBool>,
}

impl<K: StoreKey> Store<K> {
    /// Start configuring a store over the given value and TOC directories.
    pub fn builder(
        path: impl Into<std::path::PathBuf>,
        path_toc: impl Into<std::path::PathBuf>,
    ) -> StoreBuilder<K> {
        StoreBuilder::new(path, path_toc)
    }

    /// Maximum value length this store accepts.
    pub fn value_cap(&self) -> u32 {
        self.core.cfg.value_cap
    }

    /// Ensure everything buffered at the time of the call is on disk.
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Resume accepting user writes and deletes.
    pub fn enable_writes(&self) {
        self.core.enable_writes(true);
    }

    /// Reject user writes and deletes with `Disabled` until re-enabled.
    /// Internal writes (replication, compaction, tombstone discard) keep
    /// flowing.
    pub fn disable_writes(&self) {
        self.core.disable_writes(true);
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.core.stats.snapshot();
        snapshot.out_of_place_key_detections = self.core.locmap.out_of_place_key_detections();
        snapshot
    }

    pub fn enable_out_pull_replication(&self) {
        if let Some(pull) = &self.pull {
            notify(&pull.out_notify_tx, BgAction::Enable);
        }
    }

    pub fn disable_out_pull_replication(&self) {
        if let Some(pull) = &self.pull {
            notify(&pull.out_notify_tx, BgAction::Disable);
        }
    }

    /// Run one outgoing pull-replication pass right now. A pass already in
    /// flight is aborted first, so one full pass is guaranteed; responses
    /// from peers will arrive after this returns.
    pub fn pull_replication_pass(&self) {
        if let Some(pull) = &self.pull {
            pull.out_abort.store(true, Ordering::Release);
            notify(&pull.out_notify_tx, BgAction::Pass);
        }
    }

    pub fn enable_tombstone_discard(&self) {
        notify(&self.tombstone_notify_tx, BgAction::Enable);
    }

    pub fn disable_tombstone_discard(&self) {
        notify(&self.tombstone_notify_tx, BgAction::Disable);
    }

    /// Run one tombstone-discard pass right now.
    pub fn tombstone_discard_pass(&self) {
        self.tombstone_abort.store(true, Ordering::Release);
        notify(&self.tombstone_notify_tx, BgAction::Pass);
    }

    pub fn enable_compaction(&self) {
        notify(&self.compaction_notify_tx, BgAction::Enable);
    }

    pub fn disable_compaction(&self) {
        notify(&self.compaction_notify_tx, BgAction::Disable);
    }

    /// Run one compaction pass right now.
    pub fn compaction_pass(&self) {
        self.compaction_abort.store(true, Ordering::Release);
        notify(&self.compaction_notify_tx, BgAction::Pass);
    }

    /// Enable every background subsystem and writes.
    pub fn enable_all(&self) {
        self.enable_tombstone_discard();
        self.enable_out_pull_replication();
        self.enable_writes();
        self.enable_compaction();
    }

    /// Disable every background subsystem, but not writes.
    pub fn disable_all_background(&self) {
        self.disable_tombstone_discard();
        self.disable_compaction();
        self.disable_out_pull_replication();
    }

    /// Disable every background subsystem and writes.
    pub fn disable_all(&self) {
        self.disable_all_background();
        self.disable_writes();
    }
}

impl<K: StoreKey> Drop for Store<K> {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Release);
    }
}
