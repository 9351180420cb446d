//! Log facade
//!
//! Composes the buffer pool and the rotation manager behind the public
//! lifecycle: open, append, mark, replay, close. `open` recovers the block
//! sequence and mark state from the file set, so a crash-restarted process
//! resumes where the last fully written block ended.

use std::sync::{Arc, Mutex};

use crate::config::LogConfig;
use crate::errors::{LogError, LogResult};
use crate::flusher::Flusher;
use crate::key::LogKey;
use crate::logger::{self, Severity};
use crate::pool::BufferPool;
use crate::record::{AutoMarkPayload, MarkPayload, RecordType};
use crate::replay::{self, RecordSink};
use crate::rotation::RotationManager;
use crate::stats::{LogStats, LogStatsSnapshot};

/// Callback invoked when a file is approaching reuse while the active mark
/// still lies below its contents. The argument is the first key that must
/// remain safe: the listener is expected to re-append any still-live older
/// records and advance the mark at least that far.
///
/// The listener runs outside the engine's locks and may call back into the
/// log.
pub trait OverflowListener: Send + Sync {
    fn on_overflow_imminent(&self, first_safe_key: LogKey);
}

/// A group-commit write-ahead log over a rotating set of fixed-size files.
pub struct Log {
    config: LogConfig,
    pool: Arc<BufferPool>,
    rotation: Arc<RotationManager>,
    stats: Arc<LogStats>,
    flusher: Mutex<Option<Flusher>>,
    overflow_listener: Mutex<Option<Box<dyn OverflowListener>>>,
}

impl Log {
    /// Open the log: create or recover the file set, resume the block
    /// sequence after the highest fully written block, and start the
    /// background flush task.
    pub fn open(config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        let stats = Arc::new(LogStats::new());
        let (rotation, recovered) = RotationManager::open(&config, Arc::clone(&stats))?;
        let rotation = Arc::new(rotation);
        let pool = Arc::new(BufferPool::new(
            &config,
            recovered.next_bsn,
            Arc::clone(&rotation),
            Arc::clone(&stats),
        ));
        let flusher = Flusher::spawn(
            Arc::clone(&pool),
            Arc::clone(&stats),
            std::time::Duration::from_millis(config.flush_interval_ms),
        )?;
        logger::emit(
            Severity::Info,
            "log_open",
            &[
                ("dir", config.dir.display().to_string()),
                ("next_bsn", recovered.next_bsn.to_string()),
                ("active_mark", rotation.active_mark().to_string()),
            ],
        );
        Ok(Self {
            config,
            pool,
            rotation,
            stats,
            flusher: Mutex::new(Some(flusher)),
            overflow_listener: Mutex::new(None),
        })
    }

    /// Append one record.
    ///
    /// With `durable` set, returns only after the record's block is on
    /// stable storage; otherwise returns as soon as the record is framed.
    ///
    /// # Errors
    ///
    /// `RecordTooLarge`, `LogFileOverflow`, `LogClosed`, or an I/O error.
    pub fn put(&self, data: &[u8], durable: bool) -> LogResult<LogKey> {
        self.put_parts(&[data], durable)
    }

    /// Append one record assembled from multiple payload parts, framed as a
    /// single contiguous record.
    pub fn put_parts(&self, parts: &[&[u8]], durable: bool) -> LogResult<LogKey> {
        self.append_record(RecordType::Data, parts, durable)
    }

    /// Advance the active mark to `key` and persist a mark control record.
    ///
    /// # Errors
    ///
    /// `InvalidLogKey` when `key` is below the current active mark.
    pub fn mark(&self, key: LogKey, durable: bool) -> LogResult<()> {
        self.rotation.check_mark(key)?;
        let payload = MarkPayload { mark: key }.serialize();
        self.append_record(RecordType::Mark, &[&payload], durable)?;
        self.rotation.advance_mark(key)
    }

    /// Toggle automatic marking: when enabled, every successful sync append
    /// advances the mark to its own key. The toggle is persisted as a
    /// control record.
    pub fn set_auto_mark(&self, enabled: bool) -> LogResult<()> {
        let payload = AutoMarkPayload { enabled }.serialize();
        self.append_record(RecordType::AutoMark, &[&payload], false)?;
        self.rotation.set_auto_mark(enabled);
        Ok(())
    }

    /// Current active mark.
    pub fn active_mark(&self) -> LogKey {
        self.rotation.active_mark()
    }

    /// Replay data records forward from `from` (inclusive), or from the
    /// oldest available record when `from` is [`LogKey::ZERO`]. The sink
    /// receives a terminal `EndOfLog` pseudo-record at the end of the
    /// written log.
    pub fn replay(&self, sink: &mut dyn RecordSink, from: LogKey) -> LogResult<()> {
        replay::replay(&self.rotation, self.config.buffer_size, sink, from)
    }

    /// Register the overflow listener. Replaces any previous listener.
    pub fn register_overflow_listener(&self, listener: Box<dyn OverflowListener>) {
        *self.overflow_listener.lock().unwrap() = Some(listener);
    }

    /// Point-in-time view of the engine counters.
    pub fn stats(&self) -> LogStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drain the force pipeline, stop the flush task and release the files.
    /// Further appends fail with `LogClosed`. Idempotent.
    pub fn close(&self) -> LogResult<()> {
        self.pool.shut()?;
        if let Some(flusher) = self.flusher.lock().unwrap().take() {
            flusher.stop();
        }
        self.rotation.close()?;
        logger::emit(
            Severity::Info,
            "log_close",
            &[("dir", self.config.dir.display().to_string())],
        );
        Ok(())
    }

    fn append_record(
        &self,
        rtype: RecordType,
        parts: &[&[u8]],
        durable: bool,
    ) -> LogResult<LogKey> {
        let appended = self.pool.append(rtype, parts, durable)?;
        let result = if durable {
            // Nudge the pipeline so durability is not left to the next
            // eviction, then wait for the block to resolve. Any write or
            // flush failure surfaces through the wait.
            let _ = self.pool.ensure_forced(appended.block);
            self.pool.wait_durable(appended.block)
        } else {
            Ok(())
        };
        if let Some(first_safe_key) = appended.overflow_warning {
            self.notify_overflow(first_safe_key);
        }
        result?;
        if durable && rtype == RecordType::Data && self.rotation.auto_mark() {
            self.rotation.advance_mark_if_greater(appended.key);
        }
        Ok(appended.key)
    }

    fn notify_overflow(&self, first_safe_key: LogKey) {
        logger::emit(
            Severity::Warn,
            "log_overflow_imminent",
            &[("first_safe_key", first_safe_key.to_string())],
        );
        if let Some(listener) = self.overflow_listener.lock().unwrap().as_ref() {
            listener.on_overflow_imminent(first_safe_key);
        }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> LogConfig {
        LogConfig {
            buffer_size: 256,
            max_blocks_per_file: 8,
            ..LogConfig::with_dir(dir.path())
        }
    }

    #[test]
    fn test_put_returns_increasing_keys() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        let a = log.put(b"first", false).unwrap();
        let b = log.put(b"second", false).unwrap();
        assert!(b > a);
        log.close().unwrap();
    }

    #[test]
    fn test_put_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        log.close().unwrap();
        assert!(matches!(
            log.put(b"late", false),
            Err(LogError::LogClosed)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        log.put(b"x", true).unwrap();
        log.close().unwrap();
        log.close().unwrap();
    }

    #[test]
    fn test_record_too_large_rejected_before_mutation() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        let max = small_config(&dir).max_record_payload();
        let oversize = vec![0u8; max + 1];
        assert!(matches!(
            log.put(&oversize, false),
            Err(LogError::RecordTooLarge { .. })
        ));
        // The engine still accepts records afterwards.
        log.put(b"fine", true).unwrap();
        log.close().unwrap();
    }

    #[test]
    fn test_exact_capacity_record_accepted() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let max = config.max_record_payload();
        let log = Log::open(config).unwrap();
        let payload = vec![0x7Fu8; max];
        log.put(&payload, true).unwrap();
        log.close().unwrap();
    }

    #[test]
    fn test_mark_monotonicity() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        let k1 = log.put(b"one", true).unwrap();
        let k2 = log.put(b"two", true).unwrap();
        log.mark(k2, true).unwrap();
        let err = log.mark(k1, true).unwrap_err();
        assert!(matches!(err, LogError::InvalidLogKey { .. }));
        assert_eq!(log.active_mark(), k2);
        log.close().unwrap();
    }

    #[test]
    fn test_put_parts_concatenates() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        let key = log.put_parts(&[b"head-", b"tail"], true).unwrap();

        struct Capture(Vec<(LogKey, Vec<u8>)>);
        impl RecordSink for Capture {
            fn on_record(&mut self, record: &crate::replay::ReplayedRecord<'_>) {
                if record.record_type == RecordType::Data {
                    self.0.push((record.key, record.payload.to_vec()));
                }
            }
            fn on_error(&mut self, error: &LogError) {
                panic!("unexpected replay error: {}", error);
            }
        }
        let mut sink = Capture(Vec::new());
        log.replay(&mut sink, LogKey::ZERO).unwrap();
        assert_eq!(sink.0, vec![(key, b"head-tail".to_vec())]);
        log.close().unwrap();
    }

    #[test]
    fn test_auto_mark_advances_on_durable_put() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(small_config(&dir)).unwrap();
        log.set_auto_mark(true).unwrap();
        let key = log.put(b"data", true).unwrap();
        assert_eq!(log.active_mark(), key);
        log.close().unwrap();
    }
}
