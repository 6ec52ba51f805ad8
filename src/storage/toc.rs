//! Table-of-contents files: the rotating two-writer TOC sink and the
//! checksummed TOC record stream reader shared by recovery and compaction.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, warn};

use crate::constants::{
    CHECKSUM_SIZE, FILE_HEADER_SIZE, TOC_FILE_TRAILER_SIZE,
};
use crate::core::key::StoreKey;
use crate::core::store::pipeline::TocMsg;
use crate::error::{EmberError, Result};
use crate::stats::Statistics;
use crate::storage::checksum::{read_full, ChecksummedWriter};
use crate::storage::file::toc_file_path;
use crate::utils::hash::murmur3_32;

struct TocWriter {
    writer: ChecksummedWriter<File>,
    name_timestamp: u64,
    offset: u64,
}

impl TocWriter {
    fn open<K: StoreKey>(
        path_toc: &Path,
        name_timestamp: u64,
        checksum_interval: u32,
    ) -> Result<Self> {
        let path = toc_file_path(path_toc, name_timestamp as i64, K::TOC_EXT);
        let fp = File::create(path)?;
        let mut writer = ChecksummedWriter::new(fp, checksum_interval);
        let mut head = [0u8; FILE_HEADER_SIZE];
        head[..28].copy_from_slice(K::TOC_FILE_MAGIC);
        BigEndian::write_u32(&mut head[28..], checksum_interval);
        writer.write_all(&head)?;
        Ok(Self {
            writer,
            name_timestamp,
            offset: FILE_HEADER_SIZE as u64,
        })
    }

    fn append(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_all(payload)?;
        self.offset += payload.len() as u64;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        let mut term = [0u8; TOC_FILE_TRAILER_SIZE];
        BigEndian::write_u64(&mut term[4..12], self.offset);
        term[12..].copy_from_slice(b"TERM");
        self.writer.write_all(&term)?;
        self.writer.close()?;
        Ok(())
    }
}

/// The TOC writer thread. Two writers stay open: `a` for the current value
/// file and `b` for the previous one, since late batches for the previous
/// file can still arrive while the file writer has moved on. A batch with a
/// third timestamp closes `b`, rotates `a` into it and opens a fresh `a`.
/// One flush marker per cleaner closes both and acknowledges the flush.
pub(crate) fn toc_writer_loop<K: StoreKey>(
    path_toc: PathBuf,
    checksum_interval: u32,
    cleaners: usize,
    rx: Receiver<TocMsg>,
    flushed_tx: Sender<()>,
    stats: Arc<Statistics>,
) {
    let mut writer_a: Option<TocWriter> = None;
    let mut writer_b: Option<TocWriter> = None;
    let mut flush_left = cleaners;
    while let Ok(msg) = rx.recv() {
        match msg {
            TocMsg::Flush => {
                flush_left -= 1;
                if flush_left > 0 {
                    continue;
                }
                for writer in [writer_b.take(), writer_a.take()].into_iter().flatten() {
                    if let Err(e) = writer.close() {
                        error!(error = %e, "error closing toc file");
                    }
                }
                Statistics::incr(&stats.flushes);
                let _ = flushed_tx.send(());
                flush_left = cleaners;
            }
            TocMsg::Batch(batch) => {
                if batch.len() <= 8 {
                    continue;
                }
                let bts = BigEndian::read_u64(&batch[..8]);
                let payload = &batch[8..];
                if writer_a.as_ref().map(|w| w.name_timestamp) == Some(bts) {
                    if let Err(e) = writer_a.as_mut().map(|w| w.append(payload)).transpose() {
                        error!(error = %e, "error writing toc file");
                    }
                    continue;
                }
                if writer_b.as_ref().map(|w| w.name_timestamp) == Some(bts) {
                    if let Err(e) = writer_b.as_mut().map(|w| w.append(payload)).transpose() {
                        error!(error = %e, "error writing toc file");
                    }
                    continue;
                }
                // A third timestamp means no more batches are coming for
                // the oldest file.
                if let Some(old) = writer_b.take() {
                    if let Err(e) = old.close() {
                        error!(error = %e, "error closing toc file");
                    }
                }
                writer_b = writer_a.take();
                match TocWriter::open::<K>(&path_toc, bts, checksum_interval) {
                    Ok(mut writer) => {
                        if let Err(e) = writer.append(payload) {
                            error!(error = %e, "error writing toc file");
                        }
                        writer_a = Some(writer);
                    }
                    Err(e) => {
                        error!(error = %e, timestamp = bts, "error creating toc file");
                    }
                }
            }
        }
    }
    for writer in [writer_b.take(), writer_a.take()].into_iter().flatten() {
        if let Err(e) = writer.close() {
            error!(error = %e, "error closing toc file");
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TocSummary {
    pub entries: u64,
    pub checksum_failures: u64,
    pub terminated: bool,
}

/// Stream the fixed-width records of a TOC file, verifying each checksum
/// interval. Records in chunks that fail verification are skipped and
/// counted. A file with no terminating trailer is reported via
/// `terminated = false`; its readable prefix is still delivered.
pub(crate) fn read_toc_entries<K, F>(
    path: &Path,
    expected_interval: u32,
    mut cb: F,
) -> Result<TocSummary>
where
    K: StoreKey,
    F: FnMut(K, u64, u32, u32),
{
    let entry_size = K::TOC_ENTRY_SIZE;
    let interval = expected_interval as usize;
    let mut fp = File::open(path)?;
    let mut buf = vec![0u8; interval + CHECKSUM_SIZE];
    let mut overflow: Vec<u8> = Vec::with_capacity(entry_size);
    let mut summary = TocSummary::default();
    let mut first = true;
    let mut deliver = |rec: &[u8], summary: &mut TocSummary| {
        let key = K::read_from(&rec[..K::ENCODED_LEN]);
        let timestamp = BigEndian::read_u64(&rec[K::ENCODED_LEN..K::ENCODED_LEN + 8]);
        let offset = BigEndian::read_u32(&rec[K::ENCODED_LEN + 8..K::ENCODED_LEN + 12]);
        let length = BigEndian::read_u32(&rec[K::ENCODED_LEN + 12..K::ENCODED_LEN + 16]);
        summary.entries += 1;
        cb(key, timestamp, offset, length);
    };
    loop {
        let got = read_full(&mut fp, &mut buf)?;
        if got < CHECKSUM_SIZE + 1 {
            break;
        }
        let mut n = got - CHECKSUM_SIZE;
        let expect = BigEndian::read_u32(&buf[n..n + CHECKSUM_SIZE]);
        if murmur3_32(&buf[..n], 0) != expect {
            summary.checksum_failures += 1;
            if got < interval + CHECKSUM_SIZE {
                break;
            }
            continue;
        }
        let mut j = 0;
        if first {
            if n < FILE_HEADER_SIZE {
                return Err(EmberError::Corrupt(format!(
                    "truncated header: {}",
                    path.display()
                )));
            }
            if &buf[..28] != K::TOC_FILE_MAGIC {
                return Err(EmberError::Corrupt(format!(
                    "unknown file type in header: {}",
                    path.display()
                )));
            }
            if BigEndian::read_u32(&buf[28..32]) != expected_interval {
                return Err(EmberError::Corrupt(format!(
                    "bad header checksum interval: {}",
                    path.display()
                )));
            }
            j = FILE_HEADER_SIZE;
            first = false;
        }
        if n < interval {
            // Final chunk; the trailer should close it.
            if n < j + TOC_FILE_TRAILER_SIZE
                || BigEndian::read_u32(&buf[n - TOC_FILE_TRAILER_SIZE..n - 12]) != 0
                || &buf[n - 4..n] != b"TERM"
            {
                warn!(file = %path.display(), "missing or bad toc trailer");
                break;
            }
            n -= TOC_FILE_TRAILER_SIZE;
            summary.terminated = true;
        }
        if !overflow.is_empty() {
            let need = entry_size - overflow.len();
            if j + need > n {
                overflow.extend_from_slice(&buf[j..n]);
                j = n;
            } else {
                overflow.extend_from_slice(&buf[j..j + need]);
                j += need;
                let rec = std::mem::take(&mut overflow);
                deliver(&rec, &mut summary);
            }
        }
        while j + entry_size <= n {
            deliver(&buf[j..j + entry_size], &mut summary);
            j += entry_size;
        }
        if j < n {
            overflow.extend_from_slice(&buf[j..n]);
        }
        if summary.terminated || got < interval + CHECKSUM_SIZE {
            break;
        }
    }
    Ok(summary)
}
