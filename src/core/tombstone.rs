//! Tombstone discard: deletion markers older than `tombstone_age` are
//! rewritten with the local-removal marker so the write pipeline retires
//! them from the index and, on the next file rewrite, from disk. Keeping
//! tombstones around for a while first is what stops a lagging replica
//! from resurrecting a deleted value.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::constants::{TSB_DELETION, TSB_LOCAL_REMOVAL};
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::core::timestamp;
use crate::stats::Statistics;

const DISCARD_BATCH: u64 = 8192;

pub(crate) fn tombstone_discard_pass<K: StoreKey>(core: &StoreCore<K>, abort: &AtomicBool) {
    let cutoff = timestamp::now_bits().saturating_sub(core.cfg.tombstone_age_bits());
    if cutoff == 0 {
        return;
    }
    let mut start = 0u64;
    let mut discarded = 0u64;
    loop {
        if abort.load(Ordering::Acquire) {
            return;
        }
        let mut expired: Vec<(K, u64)> = Vec::new();
        let (resume, more) = core.locmap.scan_callback(
            start,
            u64::MAX,
            TSB_DELETION,
            TSB_LOCAL_REMOVAL,
            cutoff,
            DISCARD_BATCH,
            &mut |key, timestamp_bits, _length| {
                expired.push((*key, timestamp_bits));
                true
            },
        );
        for (key, timestamp_bits) in expired {
            if core
                .write_internal(&key, timestamp_bits | TSB_LOCAL_REMOVAL, bytes::Bytes::new())
                .is_ok()
            {
                discarded += 1;
                Statistics::incr(&core.stats.expired_deletions);
            }
        }
        if !more {
            break;
        }
        start = resume;
    }
    if discarded > 0 {
        debug!(discarded, "tombstone discard pass");
    }
}
