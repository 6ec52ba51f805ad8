//! Anti-entropy replication: rotating bloom-filter summaries pulled
//! between replicas, bulk-set responses carrying missing entries, and
//! bulk-set-acks driving local removal of handed-off data.

pub(crate) mod bloom;
pub(crate) mod bulk_set;
pub(crate) mod bulk_set_ack;
pub(crate) mod pull;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Read and throw away `l` bytes; used when a message pool is exhausted or
/// a message is malformed, so the transport stream stays aligned.
pub(crate) fn discard(r: &mut dyn Read, mut l: u64) -> std::io::Result<()> {
    let mut toss = [0u8; 8192];
    while l > 0 {
        let want = l.min(toss.len() as u64) as usize;
        let n = r.read(&mut toss[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short message",
            ));
        }
        l -= n as u64;
    }
    Ok(())
}

/// The partition owning `key_a` under `partition_bit_count` high bits.
#[inline]
pub(crate) fn partition_of(key_a: u64, partition_bit_count: u16) -> u32 {
    if partition_bit_count == 0 {
        0
    } else {
        let shift = 64u32.saturating_sub(u32::from(partition_bit_count)).max(32);
        (key_a >> shift) as u32
    }
}

/// Drain a message channel until shutdown or disconnect.
pub(crate) fn worker_loop<T>(shutdown: &AtomicBool, rx: &Receiver<T>, mut f: impl FnMut(T)) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(msg) => f(msg),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
