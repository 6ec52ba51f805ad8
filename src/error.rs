use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmberError {
    /// The key is unknown or carries an inactive marker. A zero
    /// `timestamp_micro` means the key was never seen at all; non-zero means
    /// it was known and had a deletion marker (aka tombstone).
    #[error("not found")]
    NotFound { timestamp_micro: i64 },

    #[error("writes disabled")]
    Disabled,

    #[error("value length of {len} > {cap}")]
    ValueTooLarge { len: usize, cap: usize },

    #[error("timestamp {0} outside [{min}, {max}]", min = crate::constants::TIMESTAMP_MICRO_MIN, max = crate::constants::TIMESTAMP_MICRO_MAX)]
    TimestampOutOfRange(i64),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no capacity within timeout")]
    Capacity,

    #[error("channel closed")]
    ChannelClosed,

    #[error("store shutting down")]
    ShuttingDown,

    #[error("too many location blocks")]
    BlockIdsExhausted,
}

impl EmberError {
    /// The previously stored timestamp carried by `NotFound`, in
    /// microseconds. Zero for every other error kind.
    pub fn timestamp_micro(&self) -> i64 {
        match self {
            EmberError::NotFound { timestamp_micro } => *timestamp_micro,
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, EmberError>;
