//! The write pipeline: per-shard mem writers feeding a single file writer,
//! per-shard mem cleaners re-pointing the index at file locations, and the
//! TOC writer persisting the records recovery replays.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::error;

use crate::constants::{FILE_HEADER_SIZE, TSB_COMPACTION_REWRITE, TSB_LOCAL_REMOVAL};
use crate::core::key::StoreKey;
use crate::core::locmap::LocMap;
use crate::core::store::builder::Config;
use crate::core::store::mem_block::{BlockRegistry, MemBlock};
use crate::error::{EmberError, Result};
use crate::stats::Statistics;
use crate::storage::file::{StoreFile, StoreFileWriter};

pub(crate) enum WriteReq<K: StoreKey> {
    Write {
        key: K,
        timestamp_bits: u64,
        value: Bytes,
        internal: bool,
        resp: Sender<Result<u64>>,
    },
    Enable,
    Disable,
    Flush,
}

pub(crate) enum FileMsg<K: StoreKey> {
    Block(Arc<MemBlock<K>>),
    Flush,
}

pub(crate) enum CleanerMsg<K: StoreKey> {
    Block(Arc<MemBlock<K>>),
    Flush,
}

pub(crate) enum TocMsg {
    /// 8-byte big-endian value-file nanosecond id, then fixed-width records.
    Batch(Vec<u8>),
    Flush,
}

/// The shared pieces every pipeline thread needs. Deliberately not the
/// whole store, so pipeline threads exit once the store (and with it the
/// write channels) goes away.
pub(crate) struct PipelineCtx<K: StoreKey> {
    pub cfg: Arc<Config>,
    pub locmap: Arc<LocMap<K>>,
    pub blocks: Arc<BlockRegistry<K>>,
    pub stats: Arc<Statistics>,
    pub files: Arc<Mutex<Vec<Arc<StoreFile<K>>>>>,
    pub active_file_id: Arc<AtomicU32>,
}

impl<K: StoreKey> Clone for PipelineCtx<K> {
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg.clone(),
            locmap: self.locmap.clone(),
            blocks: self.blocks.clone(),
            stats: self.stats.clone(),
            files: self.files.clone(),
            active_file_id: self.active_file_id.clone(),
        }
    }
}

/// One write shard. Owns the current mem block; hands it to the file
/// writer when either buffer cannot take the next entry, and on flush.
pub(crate) fn mem_writer_loop<K: StoreKey>(
    ctx: PipelineCtx<K>,
    rx: Receiver<WriteReq<K>>,
    free_blocks_rx: Receiver<Arc<MemBlock<K>>>,
    file_tx: Sender<FileMsg<K>>,
) {
    let entry_size = K::TOC_ENTRY_SIZE;
    let page = ctx.cfg.page_size as usize;
    let value_cap = ctx.cfg.value_cap as usize;
    let min_alloc = ctx.cfg.min_value_alloc as usize;
    let mut enabled = false;
    let mut block: Option<Arc<MemBlock<K>>> = None;
    let mut toc_offset = 0usize;
    let mut mem_offset = 0usize;
    while let Ok(req) = rx.recv() {
        match req {
            WriteReq::Enable => enabled = true,
            WriteReq::Disable => enabled = false,
            WriteReq::Flush => {
                if toc_offset > 0 {
                    if let Some(current) = block.take() {
                        let _ = file_tx.send(FileMsg::Block(current));
                    }
                }
                let _ = file_tx.send(FileMsg::Flush);
            }
            WriteReq::Write {
                key,
                timestamp_bits,
                value,
                internal,
                resp,
            } => {
                if !enabled && !internal {
                    let _ = resp.send(Err(EmberError::Disabled));
                    continue;
                }
                let length = value.len();
                if length > value_cap {
                    let _ = resp.send(Err(EmberError::ValueTooLarge {
                        len: length,
                        cap: value_cap,
                    }));
                    continue;
                }
                let alloc = length.max(min_alloc);
                if block.is_some() && (toc_offset + entry_size > page || mem_offset + alloc > page)
                {
                    if let Some(current) = block.take() {
                        let _ = file_tx.send(FileMsg::Block(current));
                    }
                }
                let current = match &block {
                    Some(current) => current.clone(),
                    None => match free_blocks_rx.recv() {
                        Ok(fresh) => {
                            toc_offset = 0;
                            mem_offset = 0;
                            block = Some(fresh.clone());
                            fresh
                        }
                        Err(_) => {
                            let _ = resp.send(Err(EmberError::ShuttingDown));
                            break;
                        }
                    },
                };
                {
                    // Growing with resize zero-fills the [length, alloc)
                    // pad so the appended bytes are deterministic.
                    let mut inner = current.inner.write();
                    inner.values.resize(mem_offset + alloc, 0);
                    inner.values[mem_offset..mem_offset + length].copy_from_slice(&value);
                }
                let prior = ctx.locmap.set(
                    &key,
                    timestamp_bits,
                    current.id(),
                    mem_offset as u32,
                    length as u32,
                    false,
                );
                if prior < timestamp_bits {
                    let mut inner = current.inner.write();
                    inner.toc.resize(toc_offset + entry_size, 0);
                    let rec = &mut inner.toc[toc_offset..toc_offset + entry_size];
                    key.write_to(&mut rec[..K::ENCODED_LEN]);
                    BigEndian::write_u64(&mut rec[K::ENCODED_LEN..K::ENCODED_LEN + 8], timestamp_bits);
                    BigEndian::write_u32(
                        &mut rec[K::ENCODED_LEN + 8..K::ENCODED_LEN + 12],
                        mem_offset as u32,
                    );
                    BigEndian::write_u32(
                        &mut rec[K::ENCODED_LEN + 12..K::ENCODED_LEN + 16],
                        length as u32,
                    );
                    toc_offset += entry_size;
                    mem_offset += alloc;
                } else {
                    // Superseded; reclaim the bytes we staged.
                    let mut inner = current.inner.write();
                    inner.values.truncate(mem_offset);
                }
                let _ = resp.send(Ok(prior));
            }
        }
    }
}

/// The single file writer. Rotates value files at `file_cap` and fans one
/// flush out to every cleaner once each shard has flushed.
pub(crate) fn file_writer_loop<K: StoreKey>(
    ctx: PipelineCtx<K>,
    rx: Receiver<FileMsg<K>>,
    cleaner_txs: Vec<Sender<CleanerMsg<K>>>,
) {
    let file_cap = ctx.cfg.file_cap as u64;
    let mut writer: Option<StoreFileWriter<K>> = None;
    let mut toc_len = 0u64;
    let mut value_len = 0u64;
    let mut flush_left = ctx.cfg.workers;
    while let Ok(msg) = rx.recv() {
        match msg {
            FileMsg::Flush => {
                flush_left -= 1;
                if flush_left > 0 {
                    continue;
                }
                if let Some(w) = writer.take() {
                    ctx.active_file_id.store(0, Ordering::Release);
                    if let Err(e) = w.close_writing() {
                        error!(error = %e, "error closing value file");
                    }
                }
                for tx in &cleaner_txs {
                    let _ = tx.send(CleanerMsg::Flush);
                }
                flush_left = ctx.cfg.workers;
            }
            FileMsg::Block(mem_block) => {
                let (block_toc, block_values) = {
                    let inner = mem_block.inner.read();
                    (inner.toc.len() as u64, inner.values.len() as u64)
                };
                if writer.is_some()
                    && (toc_len + block_toc >= file_cap || value_len + block_values > file_cap)
                {
                    if let Some(w) = writer.take() {
                        ctx.active_file_id.store(0, Ordering::Release);
                        if let Err(e) = w.close_writing() {
                            error!(error = %e, "error closing value file");
                        }
                    }
                }
                if writer.is_none() {
                    match StoreFileWriter::create(
                        &ctx.cfg.path,
                        ctx.cfg.workers,
                        ctx.cfg.file_readers,
                        ctx.cfg.checksum_interval,
                        &ctx.blocks,
                        cleaner_txs.clone(),
                    ) {
                        Ok(w) => {
                            ctx.files.lock().push(w.file.clone());
                            ctx.active_file_id.store(w.file.id(), Ordering::Release);
                            toc_len = FILE_HEADER_SIZE as u64;
                            value_len = FILE_HEADER_SIZE as u64;
                            writer = Some(w);
                        }
                        Err(e) => {
                            error!(error = %e, "cannot create value file");
                            break;
                        }
                    }
                }
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.write(&mem_block) {
                        error!(error = %e, "error writing value file");
                    }
                    toc_len += block_toc;
                    value_len += block_values;
                }
            }
        }
    }
    if let Some(w) = writer.take() {
        let _ = w.close_writing();
    }
}

/// One mem cleaner. Re-points each migrated entry's index location from
/// the mem block to the value file, emits the corresponding on-disk TOC
/// records, and returns drained blocks to the free pool.
pub(crate) fn mem_cleaner_loop<K: StoreKey>(
    ctx: PipelineCtx<K>,
    rx: Receiver<CleanerMsg<K>>,
    free_tx: Sender<Arc<MemBlock<K>>>,
    toc_tx: Sender<TocMsg>,
) {
    let entry_size = K::TOC_ENTRY_SIZE;
    let page = ctx.cfg.page_size as usize;
    let mut batch: Option<Vec<u8>> = None;
    let mut batch_ts: i64 = 0;
    while let Ok(msg) = rx.recv() {
        match msg {
            CleanerMsg::Flush => {
                if let Some(done) = batch.take() {
                    let _ = toc_tx.send(TocMsg::Batch(done));
                }
                let _ = toc_tx.send(TocMsg::Flush);
            }
            CleanerMsg::Block(mem_block) => {
                let (file_id, file_offset, toc) = {
                    let inner = mem_block.inner.read();
                    (inner.file_id, inner.file_offset, inner.toc.clone())
                };
                let file_ts = ctx
                    .blocks
                    .get(file_id)
                    .map(|b| b.timestamp_nano())
                    .unwrap_or(0);
                if batch.is_some() && batch_ts != file_ts {
                    if let Some(done) = batch.take() {
                        let _ = toc_tx.send(TocMsg::Batch(done));
                    }
                }
                let mut kept = 0u64;
                let mut i = 0;
                while i + entry_size <= toc.len() {
                    let rec = &toc[i..i + entry_size];
                    i += entry_size;
                    let key = K::read_from(&rec[..K::ENCODED_LEN]);
                    let timestamp_bits =
                        BigEndian::read_u64(&rec[K::ENCODED_LEN..K::ENCODED_LEN + 8]);
                    let rec_offset =
                        BigEndian::read_u32(&rec[K::ENCODED_LEN + 8..K::ENCODED_LEN + 12]);
                    let rec_length =
                        BigEndian::read_u32(&rec[K::ENCODED_LEN + 12..K::ENCODED_LEN + 16]);
                    let (block_id, offset, length) = if timestamp_bits & TSB_LOCAL_REMOVAL != 0 {
                        (0, 0, 0)
                    } else {
                        (file_id, file_offset + rec_offset, rec_length)
                    };
                    if ctx
                        .locmap
                        .set(&key, timestamp_bits, block_id, offset, length, true)
                        > timestamp_bits
                    {
                        continue;
                    }
                    if batch.as_ref().map_or(false, |b| b.len() + entry_size > page) {
                        if let Some(done) = batch.take() {
                            let _ = toc_tx.send(TocMsg::Batch(done));
                        }
                    }
                    let out = batch.get_or_insert_with(|| {
                        batch_ts = file_ts;
                        let mut fresh = Vec::with_capacity(page.max(entry_size + 8));
                        let mut prefix = [0u8; 8];
                        BigEndian::write_u64(&mut prefix, file_ts as u64);
                        fresh.extend_from_slice(&prefix);
                        fresh
                    });
                    // The compaction scratch bit never reaches disk.
                    let persist_ts = timestamp_bits & !TSB_COMPACTION_REWRITE;
                    let start = out.len();
                    out.resize(start + entry_size, 0);
                    let disk_rec = &mut out[start..start + entry_size];
                    key.write_to(&mut disk_rec[..K::ENCODED_LEN]);
                    BigEndian::write_u64(&mut disk_rec[K::ENCODED_LEN..K::ENCODED_LEN + 8], persist_ts);
                    BigEndian::write_u32(&mut disk_rec[K::ENCODED_LEN + 8..K::ENCODED_LEN + 12], offset);
                    BigEndian::write_u32(
                        &mut disk_rec[K::ENCODED_LEN + 12..K::ENCODED_LEN + 16],
                        length,
                    );
                    kept += 1;
                }
                if kept > 0 {
                    let files = ctx.files.lock();
                    if let Some(file) = files.iter().find(|f| f.id() == file_id) {
                        file.add_toc_entries(kept);
                    }
                }
                {
                    let mut inner = mem_block.inner.write();
                    inner.file_id = 0;
                    inner.file_offset = 0;
                    inner.toc.clear();
                    inner.values.clear();
                }
                let _ = free_tx.send(mem_block);
            }
        }
    }
}
