//! Buffer pool and force pipeline
//!
//! Owns every block buffer for the lifetime of the log. One buffer at a
//! time is the fill target for incoming records; full or idle buffers move
//! into an ordered force queue; the force pipeline writes queued buffers in
//! strict sequence order and batches flushes across them.
//!
//! Locking discipline:
//!
//! - The pool mutex guards the free list, the fill pointer and the queue
//!   enqueue; it is held only for bookkeeping, never across I/O.
//! - The force mutex and condvar guard `next_write_bsn`, `last_flushed_bsn`
//!   and the queue dequeue, and gate the physical write/flush sequence so
//!   that block writes are strictly serialized in sequence order even though
//!   filling runs fully in parallel.
//! - Each block's own mutex and condvar guard only that block's status and
//!   waiter refcount.
//!
//! Lock order is pool -> force -> block -> rotation; no path acquires
//! against that order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::block::{Block, WaitOutcome};
use crate::config::LogConfig;
use crate::errors::{LogError, LogResult};
use crate::key::{self, LogKey};
use crate::logger::{self, Severity};
use crate::record::RecordType;
use crate::rotation::RotationManager;
use crate::stats::LogStats;

/// Result of framing one record.
pub(crate) struct Append {
    /// Key assigned to the record.
    pub key: LogKey,
    /// Pool index of the block holding it.
    pub block: usize,
    /// Forwarded rotation warning, if a file is approaching reuse while
    /// still marked.
    pub overflow_warning: Option<LogKey>,
}

struct PoolState {
    /// Indices of blocks ready for filling.
    free: Vec<usize>,
    /// Number of buffers currently participating in the pool. Grows up to
    /// `blocks.len()` under sustained load.
    active: usize,
    /// Current fill target.
    fill: Option<usize>,
    /// Sequence number the next fill block will take.
    next_fill_bsn: u64,
    closed: bool,
}

struct ForceState {
    /// Blocks awaiting their write turn, in eviction (= sequence) order.
    queue: VecDeque<usize>,
    /// Sequence number whose write turn is next.
    next_write_bsn: u64,
    /// Highest sequence number confirmed on stable storage.
    last_flushed_bsn: u64,
    /// Highest sequence number written (possibly not yet flushed).
    highest_written_bsn: u64,
    /// Blocks written since the last flush, in write order.
    unflushed: Vec<usize>,
    /// File slots touched since the last flush.
    dirty_slots: Vec<usize>,
}

pub(crate) struct BufferPool {
    blocks: Vec<Arc<Block>>,
    max_record_payload: usize,
    waiting_threshold: usize,
    flush_interval: Duration,
    state: Mutex<PoolState>,
    free_cond: Condvar,
    force: Mutex<ForceState>,
    force_cond: Condvar,
    /// Threads currently waiting (or about to wait) for durability.
    durable_waiters: AtomicUsize,
    /// Mirror of `PoolState::active` readable without the pool mutex.
    active_count: AtomicUsize,
    rotation: Arc<RotationManager>,
    stats: Arc<LogStats>,
}

impl BufferPool {
    pub(crate) fn new(
        cfg: &LogConfig,
        next_bsn: u64,
        rotation: Arc<RotationManager>,
        stats: Arc<LogStats>,
    ) -> Self {
        let blocks = (0..cfg.max_buffers)
            .map(|_| Arc::new(Block::new(cfg.buffer_size, cfg.checksum_enabled)))
            .collect();
        Self {
            blocks,
            max_record_payload: cfg.max_record_payload(),
            waiting_threshold: cfg.waiting_threads_threshold,
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            state: Mutex::new(PoolState {
                free: (0..cfg.min_buffers).rev().collect(),
                active: cfg.min_buffers,
                fill: None,
                next_fill_bsn: next_bsn,
                closed: false,
            }),
            free_cond: Condvar::new(),
            force: Mutex::new(ForceState {
                queue: VecDeque::with_capacity(cfg.max_buffers + 1),
                next_write_bsn: next_bsn,
                last_flushed_bsn: next_bsn.saturating_sub(1),
                highest_written_bsn: next_bsn.saturating_sub(1),
                unflushed: Vec::new(),
                dirty_slots: Vec::new(),
            }),
            force_cond: Condvar::new(),
            durable_waiters: AtomicUsize::new(0),
            active_count: AtomicUsize::new(cfg.min_buffers),
            rotation,
            stats,
        }
    }

    /// Number of buffers currently in the pool.
    pub(crate) fn active_blocks(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Frame one record into the current fill block, evicting and forcing
    /// full blocks as needed. Blocks only while waiting for a free buffer.
    ///
    /// For a sync append the caller is registered as a durability waiter on
    /// the returned block before the pool mutex is released, so the block
    /// cannot be recycled underneath it.
    pub(crate) fn append(
        &self,
        rtype: RecordType,
        parts: &[&[u8]],
        durable: bool,
    ) -> LogResult<Append> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > self.max_record_payload {
            return Err(LogError::RecordTooLarge {
                size: total,
                max: self.max_record_payload,
            });
        }

        let mut overflow_warning = None;
        loop {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(LogError::LogClosed);
            }

            let idx = match state.fill {
                Some(idx) => idx,
                None => {
                    let idx = loop {
                        if let Some(idx) = state.free.pop() {
                            break idx;
                        }
                        self.stats.incr_free_buffer_waits();
                        state = self.free_cond.wait(state).unwrap();
                        if state.closed {
                            return Err(LogError::LogClosed);
                        }
                    };
                    let bsn = state.next_fill_bsn;
                    if bsn > key::MAX_BSN {
                        state.free.push(idx);
                        self.free_cond.notify_one();
                        return Err(LogError::KeySpaceExhausted(bsn));
                    }
                    let assignment = match self.rotation.assign_block(bsn) {
                        Ok(a) => a,
                        Err(err) => {
                            state.free.push(idx);
                            self.free_cond.notify_one();
                            return Err(err);
                        }
                    };
                    state.next_fill_bsn += 1;
                    let block = &self.blocks[idx];
                    block.begin_fill(bsn, assignment.slot);
                    if let Some(header) = assignment.file_header {
                        let bytes = header.serialize();
                        block
                            .frame_record(RecordType::FileHeader, &[&bytes])
                            .expect("file header always fits a fresh block");
                    }
                    if assignment.overflow_warning.is_some() {
                        overflow_warning = assignment.overflow_warning;
                    }
                    state.fill = Some(idx);
                    idx
                }
            };

            match self.blocks[idx].frame_record(rtype, parts) {
                Some(key) => {
                    if durable {
                        self.blocks[idx].add_waiter();
                        self.durable_waiters.fetch_add(1, Ordering::SeqCst);
                        self.stats.incr_durable_waits();
                    }
                    self.stats.record_appended(total);
                    return Ok(Append {
                        key,
                        block: idx,
                        overflow_warning,
                    });
                }
                None => {
                    // No room: retire the fill block into the pipeline and
                    // retry with a fresh one.
                    state.fill = None;
                    self.blocks[idx].set_writing();
                    self.force.lock().unwrap().queue.push_back(idx);
                    drop(state);
                    self.force(idx, false)?;
                }
            }
        }
    }

    /// Evict the given block if it is still the fill target and drive its
    /// force. Used by sync appends so durability is not left to the next
    /// eviction or flush tick.
    pub(crate) fn ensure_forced(&self, idx: usize) -> LogResult<()> {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.fill == Some(idx) {
                state.fill = None;
                self.blocks[idx].set_writing();
                self.force.lock().unwrap().queue.push_back(idx);
                true
            } else {
                false
            }
        };
        if evicted {
            self.force(idx, false)
        } else {
            Ok(())
        }
    }

    /// Block until the given block's cycle resolves, nudging deferred
    /// flushes on timeout. Releases the caller's waiter registration.
    pub(crate) fn wait_durable(&self, idx: usize) -> LogResult<()> {
        loop {
            match self.blocks[idx].wait_cycle(self.flush_interval) {
                WaitOutcome::Done { result, recycle } => {
                    self.durable_waiters.fetch_sub(1, Ordering::SeqCst);
                    if recycle {
                        self.release_block(idx);
                    }
                    return result;
                }
                WaitOutcome::TimedOut => {
                    let _ = self.flush_pending();
                }
            }
        }
    }

    /// Drive one evicted block through the write/flush pipeline.
    ///
    /// Waits for the block's turn in sequence order, issues the physical
    /// write, then decides whether to flush now or defer into a later,
    /// larger batch. First matching rule wins:
    ///
    /// 1. nothing further is queued and at least one thread is waiting
    /// 2. the background flush task supplied a timeout hint
    /// 3. unflushed blocks exceed half the pool
    /// 4. waiting threads exceed the configured threshold
    fn force(&self, idx: usize, timeout_hint: bool) -> LogResult<()> {
        let block = &self.blocks[idx];
        let bsn = block.bsn();

        let mut force = self.force.lock().unwrap();
        while force.next_write_bsn != bsn {
            force = self.force_cond.wait(force).unwrap();
        }
        let front = force.queue.pop_front();
        debug_assert_eq!(front, Some(idx));

        let write_result = block.write_out(&self.rotation);
        force.next_write_bsn = bsn + 1;
        self.force_cond.notify_all();
        self.stats.incr_forces();

        let slot = match write_result {
            Ok(slot) => slot,
            Err(err) => {
                drop(force);
                logger::emit(
                    Severity::Error,
                    "block_write_failed",
                    &[("bsn", bsn.to_string()), ("error", err.to_string())],
                );
                self.complete_block(idx, Err(err.clone()));
                return Err(err);
            }
        };
        force.highest_written_bsn = bsn;
        force.unflushed.push(idx);
        if !force.dirty_slots.contains(&slot) {
            force.dirty_slots.push(slot);
        }
        self.stats.incr_blocks_written();

        let waiting = self.durable_waiters.load(Ordering::SeqCst);
        let should_flush = (force.queue.is_empty() && waiting > 0)
            || timeout_hint
            || force.unflushed.len() > self.active_blocks() / 2
            || waiting > self.waiting_threshold;
        if should_flush {
            self.flush_locked(force)
        } else {
            Ok(())
        }
    }

    /// Flush everything written but not yet durable.
    pub(crate) fn flush_pending(&self) -> LogResult<()> {
        let force = self.force.lock().unwrap();
        self.flush_locked(force)
    }

    fn flush_locked(&self, mut force: MutexGuard<'_, ForceState>) -> LogResult<()> {
        if force.last_flushed_bsn >= force.highest_written_bsn {
            debug_assert!(force.unflushed.is_empty());
            return Ok(());
        }
        let dirty: Vec<usize> = std::mem::take(&mut force.dirty_slots);
        let mut sync_result = Ok(());
        for slot in dirty {
            if let Err(err) = self.rotation.sync_slot(slot) {
                sync_result = Err(err);
                break;
            }
        }
        let done: Vec<usize> = std::mem::take(&mut force.unflushed);
        match sync_result {
            Ok(()) => {
                force.last_flushed_bsn = force.highest_written_bsn;
                self.stats.flush_completed(done.len() as u64);
                drop(force);
                for idx in done {
                    self.complete_block(idx, Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                // The drained blocks are resolved (with the error); nothing
                // will flush them again this cycle.
                force.last_flushed_bsn = force.highest_written_bsn;
                drop(force);
                logger::emit(
                    Severity::Error,
                    "flush_failed",
                    &[("error", err.to_string())],
                );
                for idx in &done {
                    self.complete_block(*idx, Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Deliver a block's outcome and recycle it when nobody is waiting. The
    /// affected block returns to the free pool even on error; the engine
    /// does not assume the failure is permanent.
    fn complete_block(&self, idx: usize, result: LogResult<()>) {
        if self.blocks[idx].complete(result) {
            self.release_block(idx);
        }
    }

    fn release_block(&self, idx: usize) {
        self.blocks[idx].retire();
        let mut state = self.state.lock().unwrap();
        state.free.push(idx);
        // notify_all: both free-buffer waiters and a draining close listen
        // on this condvar.
        self.free_cond.notify_all();
    }

    /// Background tick: force the fill block if it holds records, otherwise
    /// flush anything deferred. Bounds worst-case durability latency during
    /// low-throughput periods.
    pub(crate) fn flush_tick(&self) -> LogResult<()> {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                None
            } else {
                match state.fill {
                    Some(idx) if self.blocks[idx].has_records() => {
                        state.fill = None;
                        self.blocks[idx].set_writing();
                        self.force.lock().unwrap().queue.push_back(idx);
                        Some(idx)
                    }
                    _ => None,
                }
            }
        };
        match evicted {
            Some(idx) => self.force(idx, true),
            None => self.flush_pending(),
        }
    }

    /// Add buffers to the pool, about half again the current size, bounded
    /// by the configured maximum. Returns false when already at the bound.
    pub(crate) fn grow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.active >= self.blocks.len() {
            return false;
        }
        let target = (state.active + state.active / 2)
            .max(state.active + 1)
            .min(self.blocks.len());
        for idx in state.active..target {
            state.free.push(idx);
        }
        let grown_to = target;
        state.active = grown_to;
        self.active_count.store(grown_to, Ordering::Relaxed);
        self.free_cond.notify_all();
        self.stats.incr_pool_grows();
        logger::emit(
            Severity::Info,
            "buffer_pool_grown",
            &[("buffers", grown_to.to_string())],
        );
        true
    }

    /// Shut the pool: refuse new appends, push the fill block through the
    /// pipeline, and wait for every buffer to drain back to the free list.
    pub(crate) fn shut(&self) -> LogResult<()> {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.free_cond.notify_all();
            match state.fill.take() {
                Some(idx) if self.blocks[idx].has_records() => {
                    self.blocks[idx].set_writing();
                    self.force.lock().unwrap().queue.push_back(idx);
                    Some(idx)
                }
                Some(idx) => {
                    state.free.push(idx);
                    None
                }
                None => None,
            }
        };
        let mut result = match evicted {
            Some(idx) => self.force(idx, true),
            None => self.flush_pending(),
        };

        let mut state = self.state.lock().unwrap();
        while state.free.len() < state.active {
            let (guard, wait) = self
                .free_cond
                .wait_timeout(state, self.flush_interval)
                .unwrap();
            state = guard;
            if wait.timed_out() {
                drop(state);
                let flush = self.flush_pending();
                if result.is_ok() {
                    result = flush;
                }
                state = self.state.lock().unwrap();
            }
        }
        result
    }
}
