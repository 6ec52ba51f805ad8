//! Timestamp bit layout helpers.
//!
//! A stored timestamp is `(microseconds since the Unix epoch) << 8` with the
//! low 8 bits reserved for bookkeeping markers (see `constants`). An all-zero
//! timestamp means "absent".

use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::TSB_UTIL_BITS;

/// Shift a public microsecond timestamp into internal bit form.
#[inline]
pub fn micro_to_bits(timestamp_micro: i64) -> u64 {
    (timestamp_micro as u64) << TSB_UTIL_BITS
}

/// Recover the public microsecond timestamp from internal bit form,
/// discarding the util bits.
#[inline]
pub fn bits_to_micro(timestamp_bits: u64) -> i64 {
    (timestamp_bits >> TSB_UTIL_BITS) as i64
}

/// Current wall time in microseconds since the Unix epoch.
#[inline]
pub fn now_micro() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Current wall time in internal bit form.
#[inline]
pub fn now_bits() -> u64 {
    micro_to_bits(now_micro())
}

/// Current wall time in nanoseconds since the Unix epoch; value and TOC
/// files are named by this.
#[inline]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
