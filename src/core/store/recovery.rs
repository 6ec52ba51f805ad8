//! Startup recovery: replay every TOC file against the location map. Full
//! store state is reconstructable from the TOC directory alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use crate::constants::TSB_LOCAL_REMOVAL;
use crate::core::key::StoreKey;
use crate::core::store::pipeline::PipelineCtx;
use crate::error::Result;
use crate::stats::Statistics;
use crate::storage::file::StoreFile;
use crate::storage::toc::read_toc_entries;

struct RecoveredEntry<K: StoreKey> {
    key: K,
    timestamp_bits: u64,
    block_id: u32,
    offset: u32,
    length: u32,
}

/// Enumerate the TOC directory in name order and feed every record through
/// `locmap.set(..., even_if_same_timestamp = true)`, partitioned across
/// `workers` by key_b. Truncated and corrupt files are logged, counted and
/// processed up to their last good interval.
pub(crate) fn recover<K: StoreKey>(ctx: &PipelineCtx<K>) -> Result<()> {
    let started = Instant::now();
    let workers = ctx.cfg.workers.max(1);
    let batch_size = ctx.cfg.recovery_batch_size;
    let caused_change = AtomicU64::new(0);

    let mut names: Vec<i64> = Vec::new();
    let suffix = format!(".{}", K::TOC_EXT);
    for dir_entry in std::fs::read_dir(&ctx.cfg.path_toc)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(&suffix) else {
            continue;
        };
        match stem.parse::<i64>() {
            Ok(ts) if ts > 0 => names.push(ts),
            _ => error!(name, "bad timestamp in toc file name"),
        }
    }
    names.sort_unstable();

    let from_disk = thread::scope(|scope| {
        let mut txs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = bounded::<Vec<RecoveredEntry<K>>>(4);
            let locmap = ctx.locmap.clone();
            let caused_change = &caused_change;
            scope.spawn(move || {
                while let Ok(entries) = rx.recv() {
                    for e in entries {
                        let block_id = if e.timestamp_bits & TSB_LOCAL_REMOVAL != 0 {
                            0
                        } else {
                            e.block_id
                        };
                        if locmap.set(&e.key, e.timestamp_bits, block_id, e.offset, e.length, true)
                            < e.timestamp_bits
                        {
                            caused_change.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
            txs.push(tx);
        }

        let mut batches: Vec<Vec<RecoveredEntry<K>>> = (0..workers)
            .map(|_| Vec::with_capacity(batch_size))
            .collect();
        let mut from_disk = 0u64;
        for name_timestamp in names {
            let file = match StoreFile::open_read(
                &ctx.cfg.path,
                name_timestamp,
                ctx.cfg.file_readers,
                &ctx.blocks,
            ) {
                Ok(file) => file,
                Err(e) => {
                    error!(timestamp = name_timestamp, error = %e, "error opening value file");
                    continue;
                }
            };
            ctx.files.lock().push(file.clone());
            let file_id = file.id();
            let toc_path = crate::storage::file::toc_file_path(
                &ctx.cfg.path_toc,
                name_timestamp,
                K::TOC_EXT,
            );
            let result = read_toc_entries::<K, _>(
                &toc_path,
                ctx.cfg.checksum_interval,
                |key, timestamp_bits, offset, length| {
                    let w = (key.key_b() % workers as u64) as usize;
                    batches[w].push(RecoveredEntry {
                        key,
                        timestamp_bits,
                        block_id: file_id,
                        offset,
                        length,
                    });
                    if batches[w].len() >= batch_size {
                        let full = std::mem::replace(&mut batches[w], Vec::with_capacity(batch_size));
                        let _ = txs[w].send(full);
                    }
                },
            );
            match result {
                Ok(summary) => {
                    from_disk += summary.entries;
                    file.add_toc_entries(summary.entries);
                    if !summary.terminated {
                        error!(file = %toc_path.display(), "early end of file");
                    }
                    if summary.checksum_failures > 0 {
                        warn!(
                            file = %toc_path.display(),
                            failures = summary.checksum_failures,
                            "checksum failures"
                        );
                        Statistics::add(&ctx.stats.checksum_failures, summary.checksum_failures);
                    }
                }
                Err(e) => {
                    error!(file = %toc_path.display(), error = %e, "error reading toc file");
                }
            }
        }
        for (w, batch) in batches.into_iter().enumerate() {
            if !batch.is_empty() {
                let _ = txs[w].send(batch);
            }
        }
        drop(txs);
        from_disk
    });

    Statistics::add(&ctx.stats.from_disk_count, from_disk);
    let elapsed = started.elapsed();
    info!(
        locations = from_disk,
        caused_change = caused_change.load(Ordering::Relaxed),
        elapsed_ms = elapsed.as_millis() as u64,
        rate = (from_disk as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "recovery complete"
    );
    Ok(())
}
