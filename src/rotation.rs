//! File rotation and mark management
//!
//! Decides which file slot each block is destined for, rotates to the next
//! slot every `max_blocks_per_file` blocks, and refuses to rotate into a
//! slot still covered by the active mark. The active mark is the oldest
//! record key the caller still considers live; it never regresses.
//!
//! On every rotation the first record of the new file is a file header
//! control record carrying the mark state and switch time, so a reader can
//! reposition after a crash without external metadata.

use std::fs;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::block::{self, BlockHeader};
use crate::config::LogConfig;
use crate::errors::{LogError, LogResult};
use crate::file_slot::FileSlot;
use crate::key::LogKey;
use crate::logger::{self, Severity};
use crate::record::{self, AutoMarkPayload, FileHeaderPayload, MarkPayload, RecordType};
use crate::stats::LogStats;

/// Outcome of binding a block to a file slot.
#[derive(Debug)]
pub(crate) struct SlotAssignment {
    /// Destination slot index.
    pub slot: usize,
    /// File header record to frame first, present when this block starts a
    /// new file.
    pub file_header: Option<FileHeaderPayload>,
    /// High mark of the slot that will be reused next, when the active mark
    /// has not yet reached it. The facade forwards this to the overflow
    /// listener.
    pub overflow_warning: Option<LogKey>,
}

/// State recovered from the file set at open.
pub(crate) struct Recovered {
    /// Where the fill sequence resumes.
    pub next_bsn: u64,
}

struct RotationInner {
    slots: Vec<FileSlot>,
    /// Slot receiving fill blocks.
    current: usize,
    /// Blocks assigned to the current slot this cycle; 0 before the first
    /// block is ever assigned.
    blocks_in_current: u64,
    active_mark: LogKey,
    auto_mark: bool,
    last_switch_ms: i64,
}

pub(crate) struct RotationManager {
    max_blocks_per_file: u64,
    block_capacity: usize,
    stats: Arc<LogStats>,
    inner: Mutex<RotationInner>,
}

impl RotationManager {
    /// Open the file set, recover on-disk state, and resume the block
    /// sequence after the highest fully written block.
    pub(crate) fn open(cfg: &LogConfig, stats: Arc<LogStats>) -> LogResult<(Self, Recovered)> {
        fs::create_dir_all(&cfg.dir).map_err(|e| {
            LogError::Io(format!(
                "failed to create log directory {}: {}",
                cfg.dir.display(),
                e
            ))
        })?;

        let mut slots = Vec::with_capacity(cfg.max_files);
        let mut found: Vec<(usize, u64, u64)> = Vec::new();
        for i in 0..cfg.max_files {
            let mut slot = FileSlot::open(i, &cfg.file_path(i), cfg.buffer_size)?;
            let (first, run) =
                scan_slot(&mut slot, cfg.buffer_size, cfg.max_blocks_per_file)?;
            if run > 0 {
                found.push((i, first, run));
            }
            slots.push(slot);
        }
        found.sort_by_key(|&(_, first, _)| first);

        // Only the contiguous chain of files ending at the newest block is
        // live; anything older was logically overwritten by rotation.
        let mut live_start = found.len();
        for idx in (0..found.len()).rev() {
            if idx + 1 == found.len() || found[idx].1 + found[idx].2 == found[idx + 1].1 {
                live_start = idx;
            } else {
                break;
            }
        }
        let live: Vec<(usize, u64, u64)> = found[live_start..].to_vec();
        for &(i, first, run) in &live {
            slots[i].recover(first, run);
        }
        for pair in live.windows(2) {
            let (older, _, _) = pair[0];
            let (_, newer_first, _) = pair[1];
            slots[older].set_high_mark(LogKey::new(newer_first, block::HEADER_SIZE as u32));
        }

        let now = Utc::now().timestamp_millis();
        let (inner, next_bsn) = match live.last() {
            Some(&(newest, newest_first, newest_run)) => {
                let highest = newest_first + newest_run - 1;
                let (active_mark, auto_mark) =
                    restore_mark_state(&mut slots, &live, cfg.buffer_size, cfg.auto_mark)?;
                (
                    RotationInner {
                        slots,
                        current: newest,
                        blocks_in_current: newest_run,
                        active_mark,
                        auto_mark,
                        last_switch_ms: now,
                    },
                    highest + 1,
                )
            }
            None => (
                RotationInner {
                    slots,
                    current: 0,
                    blocks_in_current: 0,
                    active_mark: LogKey::ZERO,
                    auto_mark: cfg.auto_mark,
                    last_switch_ms: now,
                },
                1,
            ),
        };

        Ok((
            Self {
                max_blocks_per_file: cfg.max_blocks_per_file,
                block_capacity: cfg.buffer_size,
                stats,
                inner: Mutex::new(inner),
            },
            Recovered { next_bsn },
        ))
    }

    /// Bind a block to a file slot; called once per block initialization.
    ///
    /// # Errors
    ///
    /// `LogFileOverflow` when rotation would reuse a slot whose high mark is
    /// above the active mark. Never retried internally; the caller must
    /// advance the mark first.
    pub(crate) fn assign_block(&self, bsn: u64) -> LogResult<SlotAssignment> {
        let mut inner = self.inner.lock().unwrap();
        if inner.blocks_in_current > 0 && inner.blocks_in_current < self.max_blocks_per_file {
            inner.blocks_in_current += 1;
            return Ok(SlotAssignment {
                slot: inner.current,
                file_header: None,
                overflow_warning: None,
            });
        }

        let first_cycle = inner.blocks_in_current == 0;
        let next = if first_cycle {
            inner.current
        } else {
            (inner.current + 1) % inner.slots.len()
        };

        let high = inner.slots[next].high_mark();
        if high != LogKey::ZERO && inner.active_mark < high {
            return Err(LogError::LogFileOverflow {
                file: next,
                active_mark: inner.active_mark,
                high_mark: high,
            });
        }

        let first_key = LogKey::new(bsn, block::HEADER_SIZE as u32);
        let prev_high_mark = if first_cycle {
            LogKey::ZERO
        } else {
            let current = inner.current;
            inner.slots[current].set_high_mark(first_key);
            first_key
        };

        let header = FileHeaderPayload {
            auto_mark: inner.auto_mark,
            active_mark: inner.active_mark,
            prev_high_mark,
            prev_switch_time_ms: inner.last_switch_ms,
        };

        inner.slots[next].begin_cycle(bsn);
        inner.current = next;
        inner.blocks_in_current = 1;
        inner.last_switch_ms = Utc::now().timestamp_millis();
        self.stats.incr_rotations();
        logger::emit(
            Severity::Info,
            "log_file_rotation",
            &[
                ("file", next.to_string()),
                ("first_bsn", bsn.to_string()),
                ("rewinds", inner.slots[next].rewind_count().to_string()),
            ],
        );

        // Early warning one file ahead: the slot that rotation will reuse
        // next still holds records the caller has not released.
        let ahead = (next + 1) % inner.slots.len();
        let ahead_high = inner.slots[ahead].high_mark();
        let overflow_warning =
            (ahead_high != LogKey::ZERO && inner.active_mark < ahead_high).then_some(ahead_high);

        Ok(SlotAssignment {
            slot: next,
            file_header: Some(header),
            overflow_warning,
        })
    }

    /// Write one finalized block image to its slot.
    pub(crate) fn write_block(&self, slot: usize, bsn: u64, buf: &[u8]) -> LogResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.slots[slot].write_block(bsn, buf)
    }

    /// Force one slot's file contents to stable storage.
    pub(crate) fn sync_slot(&self, slot: usize) -> LogResult<()> {
        let inner = self.inner.lock().unwrap();
        inner.slots[slot].sync()
    }

    /// Read and validate the block with the given sequence number.
    ///
    /// `Ok(None)` means no such block exists (end of written log); `Err`
    /// means the block exists but fails integrity checks.
    pub(crate) fn read_block(
        &self,
        bsn: u64,
        buf: &mut [u8],
    ) -> LogResult<Option<BlockHeader>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = match inner.slots.iter().position(|s| s.contains(bsn)) {
            Some(i) => i,
            None => return Ok(None),
        };
        if !inner.slots[slot].read_block(bsn, buf)? {
            return Ok(None);
        }
        drop(inner);
        block::validate_read(buf, bsn)
    }

    /// Lowest block sequence number still readable, if any block was
    /// written.
    pub(crate) fn oldest_bsn(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|s| s.blocks_written() > 0)
            .map(|s| s.first_bsn())
            .min()
    }

    pub(crate) fn active_mark(&self) -> LogKey {
        self.inner.lock().unwrap().active_mark
    }

    pub(crate) fn auto_mark(&self) -> bool {
        self.inner.lock().unwrap().auto_mark
    }

    pub(crate) fn set_auto_mark(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_mark = enabled;
    }

    /// Reject keys below the active mark; the mark never regresses.
    pub(crate) fn check_mark(&self, key: LogKey) -> LogResult<()> {
        let inner = self.inner.lock().unwrap();
        if key < inner.active_mark {
            return Err(LogError::invalid_key(
                key,
                format!("below active mark {}", inner.active_mark),
            ));
        }
        if key.offset() as usize >= self.block_capacity {
            return Err(LogError::invalid_key(key, "offset beyond block capacity"));
        }
        Ok(())
    }

    /// Advance the active mark after its control record was appended.
    pub(crate) fn advance_mark(&self, key: LogKey) -> LogResult<()> {
        self.check_mark(key)?;
        let mut inner = self.inner.lock().unwrap();
        if key > inner.active_mark {
            inner.active_mark = key;
        }
        Ok(())
    }

    /// Auto-mark path: advance without failing on concurrent regressions.
    pub(crate) fn advance_mark_if_greater(&self, key: LogKey) {
        let mut inner = self.inner.lock().unwrap();
        if key > inner.active_mark {
            inner.active_mark = key;
        }
    }

    /// Final sync of every slot before the files are released.
    pub(crate) fn close(&self) -> LogResult<()> {
        let inner = self.inner.lock().unwrap();
        for slot in &inner.slots {
            slot.sync()?;
            logger::emit(
                Severity::Trace,
                "log_file_closed",
                &[
                    ("path", slot.path().display().to_string()),
                    ("bytes_written", slot.bytes_written().to_string()),
                    ("rewinds", slot.rewind_count().to_string()),
                ],
            );
        }
        Ok(())
    }
}

/// Find the contiguous run of valid blocks at the start of a slot's file.
fn scan_slot(
    slot: &mut FileSlot,
    capacity: usize,
    max_blocks: u64,
) -> LogResult<(u64, u64)> {
    let mut buf = vec![0u8; capacity];
    let mut first = 0u64;
    let mut run = 0u64;
    while run < max_blocks {
        if !slot.read_block_at(run, &mut buf)? {
            break;
        }
        let header = match block::inspect(&buf) {
            Some(h) => h,
            None => break,
        };
        if run == 0 {
            first = header.bsn;
        } else if header.bsn != first + run {
            break;
        }
        if !block::verify_payload(&buf, &header) {
            break;
        }
        run += 1;
    }
    Ok((first, run))
}

/// Walk the control records of the live blocks in sequence order and
/// reconstruct the mark state as of the crash or close.
fn restore_mark_state(
    slots: &mut [FileSlot],
    live: &[(usize, u64, u64)],
    capacity: usize,
    default_auto_mark: bool,
) -> LogResult<(LogKey, bool)> {
    let mut active_mark = LogKey::ZERO;
    let mut auto_mark = default_auto_mark;
    let mut buf = vec![0u8; capacity];
    for &(slot, first, run) in live {
        for index in 0..run {
            if !slots[slot].read_block_at(index, &mut buf)? {
                break;
            }
            let header = match block::inspect(&buf) {
                Some(h) => h,
                None => break,
            };
            debug_assert_eq!(header.bsn, first + index);
            let mut offset = block::HEADER_SIZE;
            while offset + record::FRAME_SIZE <= header.bytes_used {
                let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
                let length =
                    u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
                let body_start = offset + record::FRAME_SIZE;
                if body_start + length > header.bytes_used {
                    break;
                }
                let body = &buf[body_start..body_start + length];
                match RecordType::from_u16(rtype) {
                    Some(RecordType::FileHeader) => {
                        if let Ok(payload) = FileHeaderPayload::deserialize(body) {
                            if payload.active_mark > active_mark {
                                active_mark = payload.active_mark;
                            }
                            auto_mark = payload.auto_mark;
                        }
                    }
                    Some(RecordType::Mark) => {
                        if let Ok(payload) = MarkPayload::deserialize(body) {
                            if payload.mark > active_mark {
                                active_mark = payload.mark;
                            }
                        }
                    }
                    Some(RecordType::AutoMark) => {
                        if let Ok(payload) = AutoMarkPayload::deserialize(body) {
                            auto_mark = payload.enabled;
                        }
                    }
                    _ => {}
                }
                offset = body_start + length;
            }
        }
    }
    Ok((active_mark, auto_mark))
}
