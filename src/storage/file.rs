//! Append-only value files.
//!
//! A value file is written once, through a ring of interval-sized buffers:
//! the file-writer thread fills buffers, a pool of checksummer threads
//! stamps each full interval with its murmur3-32, and a single disk thread
//! restores `seq` order before appending to the file. Buffers carry the mem
//! blocks whose final bytes they hold, so a block is released to its
//! cleaner only after its bytes are on disk. Reads go through a pool of
//! independent seeking handles so different keys in one file are fetched in
//! parallel.

use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::error;

use crate::constants::{CHECKSUM_SIZE, FILE_HEADER_SIZE, TSB_DELETION, TSB_UTIL_BITS};
use crate::core::key::StoreKey;
use crate::core::store::mem_block::{BlockRegistry, LocBlock, MemBlock};
use crate::core::store::pipeline::CleanerMsg;
use crate::core::timestamp;
use crate::error::{EmberError, Result};
use crate::storage::checksum::ChecksummedReader;
use crate::utils::hash::murmur3_32;

pub(crate) fn value_file_path(dir: &Path, name_timestamp: i64) -> PathBuf {
    dir.join(format!("{name_timestamp:019}.value"))
}

pub(crate) fn toc_file_path(dir: &Path, name_timestamp: i64, ext: &str) -> PathBuf {
    dir.join(format!("{name_timestamp:019}.{ext}"))
}

/// An on-disk value file registered in the block registry.
pub(crate) struct StoreFile<K: StoreKey> {
    id: AtomicU32,
    name_timestamp: i64,
    path: PathBuf,
    readers: Vec<Mutex<ChecksummedReader<File>>>,
    toc_entries: AtomicU64,
    retired_at: Mutex<Option<Instant>>,
    _key: PhantomData<K>,
}

impl<K: StoreKey> StoreFile<K> {
    /// Open an existing value file for reading, validating its header, and
    /// register it. Used by recovery.
    pub fn open_read(
        dir: &Path,
        name_timestamp: i64,
        file_readers: usize,
        registry: &BlockRegistry<K>,
    ) -> Result<Arc<Self>> {
        let path = value_file_path(dir, name_timestamp);
        let mut first = File::open(&path)?;
        let mut header = [0u8; FILE_HEADER_SIZE];
        first.read_exact(&mut header)?;
        if &header[..28] != K::VALUE_FILE_MAGIC {
            return Err(EmberError::Corrupt(format!(
                "unknown file type in header of {}",
                path.display()
            )));
        }
        let interval = BigEndian::read_u32(&header[28..]);
        if (interval as usize) < FILE_HEADER_SIZE {
            return Err(EmberError::Corrupt(format!(
                "checksum interval {interval} too small in {}",
                path.display()
            )));
        }
        let mut readers = Vec::with_capacity(file_readers.max(1));
        readers.push(Mutex::new(ChecksummedReader::new(first, interval)));
        for _ in 1..file_readers.max(1) {
            readers.push(Mutex::new(ChecksummedReader::new(
                File::open(&path)?,
                interval,
            )));
        }
        let file = Arc::new(Self {
            id: AtomicU32::new(0),
            name_timestamp,
            path,
            readers,
            toc_entries: AtomicU64::new(0),
            retired_at: Mutex::new(None),
            _key: PhantomData,
        });
        let id = registry.add(file.clone())?;
        file.id.store(id, Ordering::Release);
        Ok(file)
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn name_timestamp(&self) -> i64 {
        self.name_timestamp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_toc_entries(&self, n: u64) {
        self.toc_entries.fetch_add(n, Ordering::Relaxed);
    }

    pub fn toc_entries(&self) -> u64 {
        self.toc_entries.load(Ordering::Relaxed)
    }

    pub fn retire(&self) {
        let mut retired = self.retired_at.lock();
        if retired.is_none() {
            *retired = Some(Instant::now());
        }
    }

    pub fn retired_at(&self) -> Option<Instant> {
        *self.retired_at.lock()
    }
}

impl<K: StoreKey> LocBlock<K> for StoreFile<K> {
    fn timestamp_nano(&self) -> i64 {
        self.name_timestamp
    }

    fn read(
        &self,
        key: &K,
        timestamp_bits: u64,
        offset: u32,
        length: u32,
        out: &mut Vec<u8>,
    ) -> Result<u64> {
        if timestamp_bits & TSB_DELETION != 0 {
            return Err(EmberError::NotFound {
                timestamp_micro: (timestamp_bits >> TSB_UTIL_BITS) as i64,
            });
        }
        let i = ((key.key_a() >> 1) % self.readers.len() as u64) as usize;
        let mut reader = self.readers[i].lock();
        reader.seek(offset as u64);
        let start = out.len();
        out.resize(start + length as usize, 0);
        match reader.read_exact(&mut out[start..]) {
            Ok(()) => Ok(timestamp_bits),
            Err(e) => {
                out.truncate(start);
                Err(e)
            }
        }
    }
}

struct WriteBuf<K: StoreKey> {
    seq: u64,
    buf: Vec<u8>,
    mem_blocks: Vec<Arc<MemBlock<K>>>,
}

enum DiskMsg<K: StoreKey> {
    Buf(WriteBuf<K>),
    Stop,
}

/// The write half of a value file, owned by the file-writer thread.
pub(crate) struct StoreFileWriter<K: StoreKey> {
    pub file: Arc<StoreFile<K>>,
    fp: Arc<File>,
    interval: usize,
    offset: u32,
    current: WriteBuf<K>,
    free_rx: Receiver<WriteBuf<K>>,
    checksum_tx: Sender<Option<WriteBuf<K>>>,
    disk_tx: Sender<DiskMsg<K>>,
    done_rx: Receiver<()>,
    workers: usize,
    cleaner_txs: Vec<Sender<CleanerMsg<K>>>,
    cleaner_index: usize,
}

impl<K: StoreKey> StoreFileWriter<K> {
    /// Create a fresh value file named by the current nanosecond time,
    /// write its header, register it, and start its checksummer pool and
    /// disk thread.
    pub fn create(
        dir: &Path,
        workers: usize,
        file_readers: usize,
        checksum_interval: u32,
        registry: &BlockRegistry<K>,
        cleaner_txs: Vec<Sender<CleanerMsg<K>>>,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let name_timestamp = timestamp::now_nanos();
        let path = value_file_path(dir, name_timestamp);
        let fp = Arc::new(File::create(&path)?);
        let interval = checksum_interval as usize;

        let (free_tx, free_rx) = bounded::<WriteBuf<K>>(workers);
        for _ in 0..workers {
            let _ = free_tx.send(WriteBuf {
                seq: 0,
                buf: Vec::with_capacity(interval + CHECKSUM_SIZE),
                mem_blocks: Vec::new(),
            });
        }
        let (checksum_tx, checksum_rx) = bounded::<Option<WriteBuf<K>>>(workers);
        let (disk_tx, disk_rx) = bounded::<DiskMsg<K>>(workers + 1);
        let (done_tx, done_rx) = bounded::<()>(workers + 1);

        for _ in 0..workers {
            let checksum_rx = checksum_rx.clone();
            let disk_tx = disk_tx.clone();
            let done_tx = done_tx.clone();
            let interval = interval;
            thread::spawn(move || {
                while let Ok(Some(mut buf)) = checksum_rx.recv() {
                    let sum = murmur3_32(&buf.buf[..interval], 0);
                    let mut tail = [0u8; CHECKSUM_SIZE];
                    BigEndian::write_u32(&mut tail, sum);
                    buf.buf.extend_from_slice(&tail);
                    if disk_tx.send(DiskMsg::Buf(buf)).is_err() {
                        break;
                    }
                }
                let _ = done_tx.send(());
            });
        }
        {
            let disk_rx = disk_rx;
            let disk_requeue = disk_tx.clone();
            let free_tx = free_tx;
            let done_tx = done_tx;
            let fp = fp.clone();
            let cleaners = cleaner_txs.clone();
            let path = path.clone();
            thread::spawn(move || {
                let mut seq = 0u64;
                let mut cleaner_index = 0usize;
                while let Ok(msg) = disk_rx.recv() {
                    match msg {
                        DiskMsg::Buf(buf) => {
                            if buf.seq != seq {
                                // Out of order; put it back and keep going.
                                let _ = disk_requeue.send(DiskMsg::Buf(buf));
                                continue;
                            }
                            if let Err(e) = (&*fp).write_all(&buf.buf) {
                                error!(file = %path.display(), error = %e, "value file write failed");
                            }
                            let mut buf = buf;
                            for block in buf.mem_blocks.drain(..) {
                                let _ = cleaners[cleaner_index].send(CleanerMsg::Block(block));
                                cleaner_index = (cleaner_index + 1) % cleaners.len();
                            }
                            buf.buf.clear();
                            let _ = free_tx.send(buf);
                            seq += 1;
                        }
                        DiskMsg::Stop => break,
                    }
                }
                let _ = done_tx.send(());
            });
        }

        let mut current = free_rx
            .recv()
            .map_err(|_| EmberError::ChannelClosed)?;
        current.seq = 0;
        current.buf.extend_from_slice(K::VALUE_FILE_MAGIC);
        let mut interval_bytes = [0u8; 4];
        BigEndian::write_u32(&mut interval_bytes, checksum_interval);
        current.buf.extend_from_slice(&interval_bytes);

        let file = Arc::new(StoreFile {
            id: AtomicU32::new(0),
            name_timestamp,
            path: path.clone(),
            readers: {
                let mut readers = Vec::with_capacity(file_readers.max(1));
                for _ in 0..file_readers.max(1) {
                    readers.push(Mutex::new(ChecksummedReader::new(
                        File::open(&path)?,
                        checksum_interval,
                    )));
                }
                readers
            },
            toc_entries: AtomicU64::new(0),
            retired_at: Mutex::new(None),
            _key: PhantomData,
        });
        let id = registry.add(file.clone())?;
        file.id.store(id, Ordering::Release);

        Ok(Self {
            file,
            fp,
            interval,
            offset: FILE_HEADER_SIZE as u32,
            current,
            free_rx,
            checksum_tx,
            disk_tx,
            done_rx,
            workers,
            cleaner_txs,
            cleaner_index: 0,
        })
    }

    /// Append a mem block's value bytes, recording where in this file they
    /// start. The block is released toward its cleaner once every byte of
    /// it has reached disk.
    pub fn write(&mut self, block: &Arc<MemBlock<K>>) -> Result<()> {
        let guard = {
            let mut inner = block.inner.write();
            inner.file_id = self.file.id();
            inner.file_offset = self.offset;
            parking_lot::RwLockWriteGuard::downgrade(inner)
        };
        if guard.values.is_empty() {
            drop(guard);
            self.forward_to_cleaner(block.clone());
            return Ok(());
        }
        let values = &guard.values;
        let mut copied = 0;
        while copied < values.len() {
            let room = self.interval - self.current.buf.len();
            let n = room.min(values.len() - copied);
            self.current.buf.extend_from_slice(&values[copied..copied + n]);
            copied += n;
            self.offset += n as u32;
            if self.current.buf.len() == self.interval {
                self.rotate_buf()?;
            }
        }
        drop(guard);
        if self.current.buf.is_empty() {
            self.forward_to_cleaner(block.clone());
        } else {
            self.current.mem_blocks.push(block.clone());
        }
        Ok(())
    }

    fn rotate_buf(&mut self) -> Result<()> {
        // Hand the full buffer off before taking a fresh one, or a
        // single-buffer ring would wait on itself.
        let seq = self.current.seq;
        let full = std::mem::replace(
            &mut self.current,
            WriteBuf {
                seq: 0,
                buf: Vec::new(),
                mem_blocks: Vec::new(),
            },
        );
        self.checksum_tx
            .send(Some(full))
            .map_err(|_| EmberError::ChannelClosed)?;
        let mut next = self
            .free_rx
            .recv()
            .map_err(|_| EmberError::ChannelClosed)?;
        next.seq = seq + 1;
        self.current = next;
        Ok(())
    }

    fn forward_to_cleaner(&mut self, block: Arc<MemBlock<K>>) {
        let _ = self.cleaner_txs[self.cleaner_index].send(CleanerMsg::Block(block));
        self.cleaner_index = (self.cleaner_index + 1) % self.cleaner_txs.len();
    }

    /// Drain the pipeline, append the trailer through the framing, and
    /// release any mem blocks whose tails were still buffered.
    pub fn close_writing(mut self) -> Result<()> {
        for _ in 0..self.workers {
            let _ = self.checksum_tx.send(None);
        }
        for _ in 0..self.workers {
            let _ = self.done_rx.recv();
        }
        let _ = self.disk_tx.send(DiskMsg::Stop);
        let _ = self.done_rx.recv();

        let mut term: &[u8] = b"TERM v0 ";
        while !term.is_empty() {
            let room = self.interval - self.current.buf.len();
            let n = room.min(term.len());
            self.current.buf.extend_from_slice(&term[..n]);
            term = &term[n..];
            self.offset += n as u32;
            if self.current.buf.len() == self.interval {
                self.write_sealed()?;
            }
        }
        if !self.current.buf.is_empty() {
            self.write_sealed()?;
        }
        let blocks: Vec<_> = self.current.mem_blocks.drain(..).collect();
        for block in blocks {
            self.forward_to_cleaner(block);
        }
        Ok(())
    }

    fn write_sealed(&mut self) -> Result<()> {
        let sum = murmur3_32(&self.current.buf, 0);
        let mut tail = [0u8; CHECKSUM_SIZE];
        BigEndian::write_u32(&mut tail, sum);
        (&*self.fp).write_all(&self.current.buf)?;
        (&*self.fp).write_all(&tail)?;
        self.current.buf.clear();
        Ok(())
    }
}
