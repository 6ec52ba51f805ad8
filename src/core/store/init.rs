//! Store construction: channel fabric, mem block preallocation, pipeline
//! worker spawn, recovery, and background subsystem launch.

use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::core::background::launcher_loop;
use crate::core::compaction::compaction_pass;
use crate::core::disk_watcher::disk_watcher_loop;
use crate::core::key::StoreKey;
use crate::core::locmap::LocMap;
use crate::core::store::builder::Config;
use crate::core::store::internal::StoreCore;
use crate::core::store::mem_block::{BlockRegistry, MemBlock};
use crate::core::store::pipeline::{self, PipelineCtx};
use crate::core::store::recovery;
use crate::core::store::Store;
use crate::core::tombstone::tombstone_discard_pass;
use crate::error::Result;
use crate::replication::bulk_set::BulkSetState;
use crate::replication::bulk_set_ack::BulkSetAckState;
use crate::replication::pull::PullState;
use crate::stats::Statistics;
use crate::storage::toc::toc_writer_loop;

pub(crate) fn open<K: StoreKey>(cfg: Config) -> Result<Store<K>> {
    std::fs::create_dir_all(&cfg.path)?;
    std::fs::create_dir_all(&cfg.path_toc)?;
    let cfg = Arc::new(cfg);
    let locmap = Arc::new(LocMap::<K>::new(cfg.locmap.clone()));
    let blocks = Arc::new(BlockRegistry::new());
    let stats = Arc::new(Statistics::new());
    let files = Arc::new(Mutex::new(Vec::new()));
    let active_file_id = Arc::new(AtomicU32::new(0));
    let shutdown = Arc::new(AtomicBool::new(false));
    let ctx = PipelineCtx {
        cfg: cfg.clone(),
        locmap: locmap.clone(),
        blocks: blocks.clone(),
        stats: stats.clone(),
        files: files.clone(),
        active_file_id: active_file_id.clone(),
    };

    let workers = cfg.workers;
    let (file_tx, file_rx) = bounded(workers);
    let (toc_tx, toc_rx) = bounded(workers);
    let (flushed_tx, flushed_rx) = bounded(1);
    let (free_blocks_tx, free_blocks_rx) = bounded(workers * cfg.write_pages_per_worker);
    for _ in 0..workers * cfg.write_pages_per_worker {
        let _ = free_blocks_tx.send(MemBlock::register(&blocks, cfg.page_size)?);
    }
    let mut cleaner_txs = Vec::with_capacity(workers);
    let mut cleaner_rxs = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = bounded(workers);
        cleaner_txs.push(tx);
        cleaner_rxs.push(rx);
    }
    let mut write_txs = Vec::with_capacity(workers);
    let mut write_rxs = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = bounded(0);
        write_txs.push(tx);
        write_rxs.push(rx);
    }

    {
        let path_toc = cfg.path_toc.clone();
        let checksum_interval = cfg.checksum_interval;
        let stats = stats.clone();
        let _ = thread::Builder::new()
            .name("ember-tocwriter".to_string())
            .spawn(move || {
                toc_writer_loop::<K>(path_toc, checksum_interval, workers, toc_rx, flushed_tx, stats)
            });
    }
    {
        let ctx = ctx.clone();
        let cleaner_txs = cleaner_txs.clone();
        let _ = thread::Builder::new()
            .name("ember-filewriter".to_string())
            .spawn(move || pipeline::file_writer_loop(ctx, file_rx, cleaner_txs));
    }
    for (i, cleaner_rx) in cleaner_rxs.into_iter().enumerate() {
        let ctx = ctx.clone();
        let free_blocks_tx = free_blocks_tx.clone();
        let toc_tx = toc_tx.clone();
        let _ = thread::Builder::new()
            .name(format!("ember-memcleaner-{i}"))
            .spawn(move || pipeline::mem_cleaner_loop(ctx, cleaner_rx, free_blocks_tx, toc_tx));
    }
    for (i, write_rx) in write_rxs.into_iter().enumerate() {
        let ctx = ctx.clone();
        let free_blocks_rx = free_blocks_rx.clone();
        let file_tx = file_tx.clone();
        let _ = thread::Builder::new()
            .name(format!("ember-memwriter-{i}"))
            .spawn(move || pipeline::mem_writer_loop(ctx, write_rx, free_blocks_rx, file_tx));
    }

    recovery::recover(&ctx)?;

    let core = Arc::new(StoreCore {
        cfg: cfg.clone(),
        locmap,
        blocks,
        stats,
        files,
        active_file_id,
        write_txs,
        flushed_rx: Mutex::new(flushed_rx),
        user_disabled: Mutex::new(false),
        shutdown: shutdown.clone(),
    });

    let (tombstone_notify_tx, tombstone_notify_rx) = bounded(1);
    let tombstone_abort = Arc::new(AtomicBool::new(false));
    {
        let pass_core = core.clone();
        let pass_abort = tombstone_abort.clone();
        let launcher_abort = tombstone_abort.clone();
        let shutdown = shutdown.clone();
        let interval = cfg.tombstone_discard_interval;
        let _ = thread::Builder::new()
            .name("ember-tombstonediscard".to_string())
            .spawn(move || {
                launcher_loop(shutdown, tombstone_notify_rx, interval, launcher_abort, move || {
                    tombstone_discard_pass(&pass_core, &pass_abort)
                })
            });
    }

    let (compaction_notify_tx, compaction_notify_rx) = bounded(1);
    let compaction_abort = Arc::new(AtomicBool::new(false));
    {
        let pass_core = core.clone();
        let pass_abort = compaction_abort.clone();
        let launcher_abort = compaction_abort.clone();
        let shutdown = shutdown.clone();
        let interval = cfg.compaction_interval;
        let _ = thread::Builder::new()
            .name("ember-compaction".to_string())
            .spawn(move || {
                launcher_loop(shutdown, compaction_notify_rx, interval, launcher_abort, move || {
                    compaction_pass(&pass_core, &pass_abort)
                })
            });
    }

    {
        let watcher_core = core.clone();
        let _ = thread::Builder::new()
            .name("ember-diskwatcher".to_string())
            .spawn(move || disk_watcher_loop(watcher_core));
    }

    let (pull, bulk_set, bulk_set_ack) = if cfg.msg_ring.is_some() {
        let ack = BulkSetAckState::launch(core.clone());
        let bulk = BulkSetState::launch(core.clone(), ack.clone());
        let pull = PullState::launch(core.clone(), bulk.clone());
        (Some(pull), Some(bulk), Some(ack))
    } else {
        (None, None, None)
    };

    Ok(Store {
        core,
        pull,
        bulk_set,
        bulk_set_ack,
        tombstone_notify_tx,
        tombstone_abort,
        compaction_notify_tx,
        compaction_abort,
    })
}
