//! Checksummed file framing.
//!
//! Every `interval` bytes of payload are followed by a 4-byte murmur3-32 of
//! that interval. The file header counts as payload, so logical offset L
//! lives at physical offset `L + 4 * (L / interval)`. The final interval may
//! be short but always carries its trailing checksum.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ByteOrder};

use crate::constants::CHECKSUM_SIZE;
use crate::error::{EmberError, Result};
use crate::utils::hash::murmur3_32;

/// Buffering writer that appends a checksum after each full interval of
/// payload. `close` seals the final partial interval.
pub struct ChecksummedWriter<W: Write> {
    inner: W,
    interval: usize,
    buf: Vec<u8>,
    offset: u64,
}

impl<W: Write> ChecksummedWriter<W> {
    pub fn new(inner: W, interval: u32) -> Self {
        Self {
            inner,
            interval: interval as usize,
            buf: Vec::with_capacity(interval as usize + CHECKSUM_SIZE),
            offset: 0,
        }
    }

    /// Logical payload bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.interval - self.buf.len();
            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            self.offset += n as u64;
            if self.buf.len() == self.interval {
                self.flush_interval()?;
            }
        }
        Ok(())
    }

    fn flush_interval(&mut self) -> Result<()> {
        let sum = murmur3_32(&self.buf, 0);
        let mut tail = [0u8; CHECKSUM_SIZE];
        BigEndian::write_u32(&mut tail, sum);
        self.inner.write_all(&self.buf)?;
        self.inner.write_all(&tail)?;
        self.buf.clear();
        Ok(())
    }

    /// Seal the final interval and return the underlying writer.
    pub fn close(mut self) -> Result<W> {
        if !self.buf.is_empty() {
            self.flush_interval()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Seekable reader that verifies each interval's checksum as it goes.
pub struct ChecksummedReader<R: Read + Seek> {
    inner: R,
    interval: usize,
    pos: u64,
    buf: Vec<u8>,
    buf_interval: Option<u64>,
}

impl<R: Read + Seek> ChecksummedReader<R> {
    pub fn new(inner: R, interval: u32) -> Self {
        Self {
            inner,
            interval: interval as usize,
            pos: 0,
            buf: Vec::with_capacity(interval as usize + CHECKSUM_SIZE),
            buf_interval: None,
        }
    }

    /// Position the reader at a logical payload offset.
    pub fn seek(&mut self, logical: u64) {
        self.pos = logical;
    }

    /// Read exactly `out.len()` payload bytes from the current position,
    /// verifying the checksum of every interval touched.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let interval_index = self.pos / self.interval as u64;
            let within = (self.pos % self.interval as u64) as usize;
            self.load_interval(interval_index)?;
            if within >= self.buf.len() {
                return Err(EmberError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of checksummed file",
                )));
            }
            let n = (self.buf.len() - within).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&self.buf[within..within + n]);
            filled += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    fn load_interval(&mut self, interval_index: u64) -> Result<()> {
        if self.buf_interval == Some(interval_index) {
            return Ok(());
        }
        self.buf_interval = None;
        let physical = interval_index * (self.interval + CHECKSUM_SIZE) as u64;
        self.inner.seek(SeekFrom::Start(physical))?;
        self.buf.resize(self.interval + CHECKSUM_SIZE, 0);
        let n = read_full(&mut self.inner, &mut self.buf)?;
        if n < CHECKSUM_SIZE + 1 {
            return Err(EmberError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short checksummed interval",
            )));
        }
        let payload = n - CHECKSUM_SIZE;
        let expect = BigEndian::read_u32(&self.buf[payload..payload + CHECKSUM_SIZE]);
        if murmur3_32(&self.buf[..payload], 0) != expect {
            return Err(EmberError::Corrupt(format!(
                "checksum mismatch in interval {interval_index}"
            )));
        }
        self.buf.truncate(payload);
        self.buf_interval = Some(interval_index);
        Ok(())
    }
}

/// Read until `buf` is full or EOF; IO errors other than EOF propagate.
pub(crate) fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EmberError::Io(e)),
        }
    }
    Ok(n)
}
