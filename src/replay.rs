//! Forward replay
//!
//! Reconstructs the logical record stream from physical blocks, starting at
//! a given key. The cursor never trusts embedded data for identity: each
//! record's key is re-derived from its byte offset within the block being
//! scanned.
//!
//! State machine: SEEK (locate the starting record inside its block) ->
//! SCAN (emit records forward, following the block sequence) -> DONE (the
//! next block cannot be read; an `EndOfLog` pseudo-record is emitted) or
//! ERROR (an integrity failure is reported once through the sink's error
//! channel and the replay terminates).

use crate::block;
use crate::errors::{LogError, LogResult};
use crate::key::LogKey;
use crate::record::{self, RecordType};
use crate::rotation::RotationManager;

/// One record delivered to a replay sink. The payload slice borrows the
/// cursor's block buffer, which is reused across the whole replay.
#[derive(Debug)]
pub struct ReplayedRecord<'a> {
    /// Key re-derived from the record's position.
    pub key: LogKey,
    /// Record type; `EndOfLog` for the terminal pseudo-record.
    pub record_type: RecordType,
    /// Record payload; empty for the terminal pseudo-record.
    pub payload: &'a [u8],
}

/// Caller-supplied consumer of a replay stream.
pub trait RecordSink {
    /// Called for every data record in key order, then once with an
    /// `EndOfLog` pseudo-record.
    fn on_record(&mut self, record: &ReplayedRecord<'_>);

    /// Called at most once, when an integrity or I/O failure terminates the
    /// replay.
    fn on_error(&mut self, error: &LogError);
}

/// Run a forward replay, emitting every data record with key at or above
/// `from` into the sink.
///
/// # Errors
///
/// `InvalidLogKey` when `from` does not name a readable record (stale or
/// foreign key). Integrity failures discovered mid-stream are delivered to
/// the sink's error channel instead and terminate the replay.
pub(crate) fn replay(
    rotation: &RotationManager,
    block_capacity: usize,
    sink: &mut dyn RecordSink,
    from: LogKey,
) -> LogResult<()> {
    let mut buf = vec![0u8; block_capacity];
    let mut seeking = from != LogKey::ZERO;

    let mut bsn = if seeking {
        from.bsn()
    } else {
        match rotation.oldest_bsn() {
            Some(oldest) => oldest,
            None => {
                emit_end(sink, 1);
                return Ok(());
            }
        }
    };

    loop {
        let header = match rotation.read_block(bsn, &mut buf) {
            Ok(Some(header)) => header,
            Ok(None) => {
                if seeking {
                    return Err(LogError::invalid_key(
                        from,
                        format!("block {} is not readable", bsn),
                    ));
                }
                emit_end(sink, bsn);
                return Ok(());
            }
            Err(err) => {
                sink.on_error(&err);
                return Ok(());
            }
        };

        let mut offset = block::HEADER_SIZE;
        while offset + record::FRAME_SIZE <= header.bytes_used {
            let rtype_raw = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let length = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let body_start = offset + record::FRAME_SIZE;
            if body_start + length > header.bytes_used {
                let err = LogError::InvalidLogBuffer(format!(
                    "record at {}:{} overflows its block",
                    bsn, offset
                ));
                sink.on_error(&err);
                return Ok(());
            }
            let key = LogKey::new(bsn, offset as u32);
            if seeking {
                if key == from {
                    seeking = false;
                } else if key > from {
                    return Err(LogError::invalid_key(
                        from,
                        "no record at that offset".to_string(),
                    ));
                }
            }
            if !seeking {
                let record_type = match RecordType::from_u16(rtype_raw) {
                    Some(t) => t,
                    None => {
                        let err = LogError::InvalidLogBuffer(format!(
                            "unknown record type {:#06x} at {}",
                            rtype_raw, key
                        ));
                        sink.on_error(&err);
                        return Ok(());
                    }
                };
                if !record_type.is_control() {
                    sink.on_record(&ReplayedRecord {
                        key,
                        record_type,
                        payload: &buf[body_start..body_start + length],
                    });
                }
            }
            offset = body_start + length;
        }

        if seeking {
            return Err(LogError::invalid_key(
                from,
                "no record at that offset".to_string(),
            ));
        }
        bsn += 1;
    }
}

fn emit_end(sink: &mut dyn RecordSink, bsn: u64) {
    sink.on_record(&ReplayedRecord {
        key: LogKey::new(bsn, 0),
        record_type: RecordType::EndOfLog,
        payload: &[],
    });
}
