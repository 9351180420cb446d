//! Engine statistics
//!
//! Plain engine-owned atomic counters exposed through a read-only snapshot;
//! no process-wide singletons. Counters use relaxed ordering: they are
//! observability data, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Operational counters for one log instance.
#[derive(Debug, Default)]
pub struct LogStats {
    /// Records accepted by `put` and control appends.
    records_appended: AtomicU64,
    /// Payload bytes accepted.
    record_bytes: AtomicU64,
    /// Blocks physically written.
    blocks_written: AtomicU64,
    /// Block force operations driven through the pipeline.
    forces: AtomicU64,
    /// Physical flush operations.
    flushes: AtomicU64,
    /// Largest number of blocks satisfied by one flush.
    max_blocks_per_flush: AtomicU64,
    /// Times a thread waited for a free block buffer.
    free_buffer_waits: AtomicU64,
    /// Sync appends that waited for durability.
    durable_waits: AtomicU64,
    /// Pool growth events.
    pool_grows: AtomicU64,
    /// File rotations.
    rotations: AtomicU64,
}

impl LogStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_appended(&self, payload_bytes: usize) {
        self.records_appended.fetch_add(1, Ordering::Relaxed);
        self.record_bytes
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn incr_blocks_written(&self) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_forces(&self) {
        self.forces.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flush_completed(&self, blocks: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.max_blocks_per_flush
            .fetch_max(blocks, Ordering::Relaxed);
    }

    pub(crate) fn incr_free_buffer_waits(&self) {
        self.free_buffer_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_durable_waits(&self) {
        self.durable_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_pool_grows(&self) {
        self.pool_grows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_rotations(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn free_buffer_waits(&self) -> u64 {
        self.free_buffer_waits.load(Ordering::Relaxed)
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            taken_at: Utc::now(),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            record_bytes: self.record_bytes.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            forces: self.forces.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            max_blocks_per_flush: self.max_blocks_per_flush.load(Ordering::Relaxed),
            free_buffer_waits: self.free_buffer_waits.load(Ordering::Relaxed),
            durable_waits: self.durable_waits.load(Ordering::Relaxed),
            pool_grows: self.pool_grows.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of the counters at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct LogStatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub records_appended: u64,
    pub record_bytes: u64,
    pub blocks_written: u64,
    pub forces: u64,
    pub flushes: u64,
    pub max_blocks_per_flush: u64,
    pub free_buffer_waits: u64,
    pub durable_waits: u64,
    pub pool_grows: u64,
    pub rotations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = LogStats::new();
        stats.record_appended(100);
        stats.record_appended(50);
        stats.incr_forces();
        stats.flush_completed(3);
        stats.flush_completed(1);

        let snap = stats.snapshot();
        assert_eq!(snap.records_appended, 2);
        assert_eq!(snap.record_bytes, 150);
        assert_eq!(snap.forces, 1);
        assert_eq!(snap.flushes, 2);
        assert_eq!(snap.max_blocks_per_flush, 3);
    }

    #[test]
    fn test_snapshot_is_serializable() {
        let stats = LogStats::new();
        stats.incr_rotations();
        let text = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(text.contains("\"rotations\":1"));
    }

    #[test]
    fn test_concurrent_increments() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(LogStats::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stats = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record_appended(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().records_appended, 4000);
    }
}
