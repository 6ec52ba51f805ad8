//! Compaction: value files whose live fraction has decayed below the
//! threshold get their still-live entries rewritten through the normal
//! write pipeline, then sit retired for a grace period before their files
//! are unlinked. Rewrites carry the compaction scratch bit so they win the
//! timestamp tie against the location they are replacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::constants::{TSB_COMPACTION_REWRITE, TSB_DELETION};
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::core::store::mem_block::LocBlock;
use crate::stats::Statistics;
use crate::storage::file::{toc_file_path, StoreFile};
use crate::storage::toc::read_toc_entries;

pub(crate) fn compaction_pass<K: StoreKey>(core: &StoreCore<K>, abort: &AtomicBool) {
    let active_id = core.active_file_id.load(Ordering::Acquire);
    let candidates: Vec<Arc<StoreFile<K>>> = core.files.lock().clone();
    for file in candidates {
        if abort.load(Ordering::Acquire) {
            return;
        }
        if file.id() == active_id {
            continue;
        }
        if let Some(retired_at) = file.retired_at() {
            if retired_at.elapsed() >= core.cfg.compaction_retirement_grace {
                unlink(core, &file);
            }
            continue;
        }
        compact_file(core, &file, abort);
    }
}

/// Replay the file's TOC against the index to measure how much of it is
/// still current; below the threshold, rewrite what lives and retire it.
fn compact_file<K: StoreKey>(core: &StoreCore<K>, file: &Arc<StoreFile<K>>, abort: &AtomicBool) {
    if file.toc_entries() == 0 {
        // Nothing from this file ever reached the index.
        file.retire();
        return;
    }
    let toc_path = toc_file_path(&core.cfg.path_toc, file.name_timestamp(), K::TOC_EXT);
    let file_id = file.id();
    let mut total = 0u64;
    let mut live: Vec<(K, u64, u32, u32)> = Vec::new();
    let locmap = core.locmap.clone();
    let summary = read_toc_entries::<K, _>(
        &toc_path,
        core.cfg.checksum_interval,
        |key, timestamp_bits, offset, length| {
            total += 1;
            let loc = locmap.get(&key);
            if loc.block_id == file_id && loc.timestamp == timestamp_bits {
                live.push((key, timestamp_bits, offset, length));
            }
        },
    );
    if let Err(e) = summary {
        error!(file = %toc_path.display(), error = %e, "compaction scan failed");
        return;
    }
    if total == 0 {
        file.retire();
        return;
    }
    let live_fraction = live.len() as f64 / total as f64;
    if live_fraction >= core.cfg.compaction_threshold {
        return;
    }
    debug!(
        file = %file.path().display(),
        total,
        live = live.len(),
        "compacting"
    );
    let mut value = Vec::new();
    for (key, timestamp_bits, offset, length) in live {
        if abort.load(Ordering::Acquire) {
            return;
        }
        let rewrite_bits = timestamp_bits | TSB_COMPACTION_REWRITE;
        if timestamp_bits & TSB_DELETION != 0 {
            if core
                .write_internal(&key, rewrite_bits, bytes::Bytes::new())
                .is_ok()
            {
                Statistics::incr(&core.stats.compaction_rewrites);
            }
            continue;
        }
        value.clear();
        if LocBlock::read(file.as_ref(), &key, timestamp_bits, offset, length, &mut value).is_err()
        {
            continue;
        }
        if core
            .write_internal(&key, rewrite_bits, bytes::Bytes::copy_from_slice(&value))
            .is_ok()
        {
            Statistics::incr(&core.stats.compaction_rewrites);
        }
    }
    file.retire();
    Statistics::incr(&core.stats.compactions);
}

fn unlink<K: StoreKey>(core: &StoreCore<K>, file: &Arc<StoreFile<K>>) {
    let toc_path = toc_file_path(&core.cfg.path_toc, file.name_timestamp(), K::TOC_EXT);
    if let Err(e) = std::fs::remove_file(file.path()) {
        error!(file = %file.path().display(), error = %e, "cannot unlink value file");
        return;
    }
    if let Err(e) = std::fs::remove_file(&toc_path) {
        error!(file = %toc_path.display(), error = %e, "cannot unlink toc file");
    }
    core.files.lock().retain(|f| f.id() != file.id());
    info!(file = %file.path().display(), "compacted file unlinked");
}
