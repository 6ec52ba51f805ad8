//! Disk watcher: polls free space under both data paths and gates writes.
//! A watcher-driven disable never overrides an explicit user disable, and
//! re-enabling only happens once free space clears the higher watermark.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::background::sleep_with_shutdown;
use crate::core::key::StoreKey;
use crate::core::store::internal::StoreCore;
use crate::stats::Statistics;

pub(crate) fn disk_watcher_loop<K: StoreKey>(core: Arc<StoreCore<K>>) {
    let mut watcher_disabled = false;
    loop {
        if !sleep_with_shutdown(&core.shutdown, core.cfg.disk_watcher_interval) {
            return;
        }
        if core.shutdown.load(Ordering::Acquire) {
            return;
        }
        let free = match free_fraction(&core.cfg.path).min(free_fraction(&core.cfg.path_toc)) {
            f if f.is_finite() => f,
            _ => continue,
        };
        if !watcher_disabled && free < core.cfg.disk_free_disable {
            warn!(free, "free space low; disabling writes");
            core.disable_writes(false);
            watcher_disabled = true;
            Statistics::incr(&core.stats.disk_watcher_disables);
        } else if watcher_disabled && free > core.cfg.disk_free_enable {
            info!(free, "free space recovered; enabling writes");
            core.enable_writes(false);
            watcher_disabled = false;
            Statistics::incr(&core.stats.disk_watcher_enables);
        }
    }
}

#[cfg(unix)]
fn free_fraction(path: &std::path::Path) -> f64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let blocks = stat.blocks() as f64;
            if blocks <= 0.0 {
                f64::NAN
            } else {
                stat.blocks_available() as f64 / blocks
            }
        }
        Err(_) => f64::NAN,
    }
}

#[cfg(not(unix))]
fn free_fraction(_path: &std::path::Path) -> f64 {
    f64::NAN
}
