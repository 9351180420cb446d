//! Rotation, overflow protection and mid-stream replay
//!
//! - Rotating into a file whose high mark exceeds the active mark fails
//!   with `LogFileOverflow` and never overwrites live data
//! - Advancing the mark unblocks rotation
//! - The overflow listener fires with the first key that must remain safe
//! - Replay from a mid-stream key yields exactly that record onward

use std::sync::{Arc, Mutex};

use howl::{
    Log, LogConfig, LogError, LogKey, OverflowListener, RecordSink, RecordType,
    ReplayedRecord,
};
use tempfile::TempDir;

fn tight_config(dir: &TempDir) -> LogConfig {
    LogConfig {
        buffer_size: 256,
        min_buffers: 2,
        max_buffers: 4,
        max_files: 2,
        max_blocks_per_file: 2,
        ..LogConfig::with_dir(dir.path())
    }
}

#[derive(Default)]
struct CollectingSink {
    records: Vec<(LogKey, Vec<u8>)>,
    end_of_log: bool,
    errors: Vec<String>,
}

impl RecordSink for CollectingSink {
    fn on_record(&mut self, record: &ReplayedRecord<'_>) {
        if record.record_type == RecordType::EndOfLog {
            self.end_of_log = true;
        } else {
            self.records.push((record.key, record.payload.to_vec()));
        }
    }

    fn on_error(&mut self, error: &LogError) {
        self.errors.push(error.to_string());
    }
}

/// Fill blocks quickly: one 180-byte record occupies a 256-byte block.
fn block_filling_payload() -> Vec<u8> {
    vec![0xA5u8; 180]
}

// =============================================================================
// Overflow protection
// =============================================================================

#[test]
fn test_unmarked_log_overflows_instead_of_overwriting() {
    let dir = TempDir::new().unwrap();
    let log = Log::open(tight_config(&dir)).unwrap();

    // 2 files x 2 blocks: the 5th block would need to reuse file 0, which
    // is still fully unconsumed.
    let mut keys = Vec::new();
    let overflow = loop {
        match log.put(&block_filling_payload(), true) {
            Ok(key) => {
                keys.push(key);
                assert!(keys.len() < 32, "overflow never surfaced");
            }
            Err(err) => break err,
        }
    };
    assert!(matches!(overflow, LogError::LogFileOverflow { .. }));

    // Nothing that was acknowledged has been lost.
    let mut sink = CollectingSink::default();
    log.replay(&mut sink, LogKey::ZERO).unwrap();
    assert!(sink.errors.is_empty());
    let replayed: Vec<LogKey> = sink.records.iter().map(|(k, _)| *k).collect();
    assert_eq!(replayed, keys);
    log.close().unwrap();
}

#[test]
fn test_marking_forward_unblocks_rotation() {
    let dir = TempDir::new().unwrap();
    let log = Log::open(tight_config(&dir)).unwrap();

    let mut keys = Vec::new();
    let overflow = loop {
        match log.put(&block_filling_payload(), true) {
            Ok(key) => keys.push(key),
            Err(err) => break err,
        }
    };
    assert!(matches!(overflow, LogError::LogFileOverflow { .. }));

    // Releasing everything written so far makes the oldest file reusable.
    log.mark(*keys.last().unwrap(), true).unwrap();
    let key = log.put(&block_filling_payload(), true).unwrap();
    assert!(key > *keys.last().unwrap());
    log.close().unwrap();
}

// =============================================================================
// Overflow listener
// =============================================================================

struct CapturingListener {
    seen: Arc<Mutex<Vec<LogKey>>>,
}

impl OverflowListener for CapturingListener {
    fn on_overflow_imminent(&self, first_safe_key: LogKey) {
        self.seen.lock().unwrap().push(first_safe_key);
    }
}

#[test]
fn test_overflow_listener_receives_first_safe_key() {
    let dir = TempDir::new().unwrap();
    let log = Log::open(tight_config(&dir)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    log.register_overflow_listener(Box::new(CapturingListener {
        seen: Arc::clone(&seen),
    }));

    let mut keys = Vec::new();
    loop {
        match log.put(&block_filling_payload(), true) {
            Ok(key) => keys.push(key),
            Err(_) => break,
        }
    }

    let warnings = seen.lock().unwrap();
    assert!(
        !warnings.is_empty(),
        "listener must fire before the log runs out of room"
    );
    // The first-safe key names a record the caller has not yet released.
    assert!(warnings.iter().all(|key| *key > log.active_mark()));
    drop(warnings);
    log.close().unwrap();
}

// =============================================================================
// Replay from a mid-stream key
// =============================================================================

#[test]
fn test_replay_from_marked_key_yields_suffix() {
    let dir = TempDir::new().unwrap();
    let config = LogConfig {
        buffer_size: 256,
        max_blocks_per_file: 16,
        ..LogConfig::with_dir(dir.path())
    };
    let log = Log::open(config).unwrap();

    let mut written = Vec::new();
    for i in 0..10 {
        let payload = format!("record-{i}").into_bytes();
        let key = log.put(&payload, true).unwrap();
        written.push((key, payload));
    }
    log.mark(written[4].0, true).unwrap();

    let mut sink = CollectingSink::default();
    log.replay(&mut sink, written[4].0).unwrap();

    assert!(sink.errors.is_empty());
    assert!(sink.end_of_log);
    assert_eq!(
        sink.records,
        written[4..].to_vec(),
        "replay from key 4 yields exactly records 4..9"
    );
    log.close().unwrap();
}

#[test]
fn test_replay_from_foreign_key_fails() {
    let dir = TempDir::new().unwrap();
    let log = Log::open(tight_config(&dir)).unwrap();
    log.put(b"only", true).unwrap();

    let mut sink = CollectingSink::default();
    let err = log
        .replay(&mut sink, LogKey::new(999, 30))
        .expect_err("stale key must be rejected");
    assert!(matches!(err, LogError::InvalidLogKey { .. }));
    assert!(sink.records.is_empty());
    log.close().unwrap();
}

#[test]
fn test_replay_from_misaligned_offset_fails() {
    let dir = TempDir::new().unwrap();
    let log = Log::open(tight_config(&dir)).unwrap();
    let key = log.put(b"aligned", true).unwrap();

    let misaligned = LogKey::new(key.bsn(), key.offset() + 1);
    let mut sink = CollectingSink::default();
    let err = log
        .replay(&mut sink, misaligned)
        .expect_err("offset between records must be rejected");
    assert!(matches!(err, LogError::InvalidLogKey { .. }));
    log.close().unwrap();
}

#[test]
fn test_empty_log_replay_is_end_of_log_only() {
    let dir = TempDir::new().unwrap();
    let log = Log::open(tight_config(&dir)).unwrap();

    let mut sink = CollectingSink::default();
    log.replay(&mut sink, LogKey::ZERO).unwrap();
    assert!(sink.records.is_empty());
    assert!(sink.end_of_log);
    log.close().unwrap();
}
