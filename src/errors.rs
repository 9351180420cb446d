//! Error taxonomy for the log engine
//!
//! Framing-time failures (`RecordTooLarge`, `LogClosed`) are synchronous and
//! local to the calling thread. Write/flush-time I/O failures are recorded on
//! the affected block and delivered to every thread waiting on it, then the
//! block is returned to the free pool so the engine can continue.
//! `LogFileOverflow` is never retried inside the engine; the caller must
//! advance the mark and try again.

use thiserror::Error;

use crate::key::LogKey;

/// Result type for log operations
pub type LogResult<T> = Result<T, LogError>;

/// Log engine errors
///
/// The enum is `Clone` so a single write or flush failure can be handed to
/// every thread blocked on the affected block.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    /// Payload plus framing overhead exceeds one block's usable capacity.
    /// Records never span blocks.
    #[error("record of {size} bytes exceeds maximum record size of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// Rotation would reuse a file that still holds unconsumed records.
    #[error(
        "log file {file} cannot be reused: active mark {active_mark} is below its high mark {high_mark}"
    )]
    LogFileOverflow {
        file: usize,
        active_mark: LogKey,
        high_mark: LogKey,
    },

    /// Operation attempted after the log was closed.
    #[error("log is closed")]
    LogClosed,

    /// Mark or replay key out of valid range.
    #[error("invalid log key {key}: {reason}")]
    InvalidLogKey { key: LogKey, reason: String },

    /// Corrupt block detected during read or replay.
    #[error("invalid log buffer: {0}")]
    InvalidLogBuffer(String),

    /// The block sequence space representable in the on-disk key format is
    /// exhausted. The engine refuses to wrap rather than reuse keys.
    #[error("block sequence number space exhausted at bsn {0}")]
    KeySpaceExhausted(u64),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

impl LogError {
    /// Shorthand for an `InvalidLogKey` with a reason.
    pub(crate) fn invalid_key(key: LogKey, reason: impl Into<String>) -> Self {
        LogError::InvalidLogKey {
            key,
            reason: reason.into(),
        }
    }
}
