//! Background flush task
//!
//! A long-lived thread that periodically forces the current fill block even
//! absent a full buffer, bounding worst-case durability latency during
//! low-throughput periods. The same tick runs the pool growth check: when
//! the rate of free-buffer waits since the last tick exceeds half the pool,
//! the pool grows.
//!
//! The thread is owned by the log, signalled through a flag and condvar,
//! and joined during close.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::errors::{LogError, LogResult};
use crate::logger::{self, Severity};
use crate::pool::BufferPool;
use crate::stats::LogStats;

pub(crate) struct Flusher {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    pub(crate) fn spawn(
        pool: Arc<BufferPool>,
        stats: Arc<LogStats>,
        interval: Duration,
    ) -> LogResult<Self> {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("howl-flush".to_string())
            .spawn(move || {
                let (flag, cond) = &*thread_shutdown;
                let mut last_waits = stats.free_buffer_waits();
                loop {
                    let stop = {
                        let guard = flag.lock().unwrap();
                        let (guard, _) = cond.wait_timeout(guard, interval).unwrap();
                        *guard
                    };
                    if stop {
                        break;
                    }
                    if let Err(err) = pool.flush_tick() {
                        logger::emit(
                            Severity::Error,
                            "flush_task_error",
                            &[("error", err.to_string())],
                        );
                    }
                    let waits = stats.free_buffer_waits();
                    if (waits - last_waits) as usize > pool.active_blocks() / 2 {
                        pool.grow();
                    }
                    last_waits = waits;
                }
            })
            .map_err(|e| LogError::Io(format!("failed to spawn flush thread: {}", e)))?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the thread and join it. Idempotent through `Option::take`.
    pub(crate) fn stop(mut self) {
        let (flag, cond) = &*self.shutdown;
        *flag.lock().unwrap() = true;
        cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
