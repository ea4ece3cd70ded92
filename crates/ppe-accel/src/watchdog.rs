//! Pending-attempt watchdog
//!
//! Background thread that force-resolves acceleration attempts whose
//! completion never arrived.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::accel::AccelStateMachine;
use crate::error::Result;

/// Running watchdog; stops when dropped
pub struct PendingWatchdog {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PendingWatchdog {
    /// Start scanning `sm` every `interval`
    pub fn spawn(sm: Arc<AccelStateMachine>, interval: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("ppe-accel-watchdog".into())
            .spawn(move || run(sm, flag, interval))?;

        tracing::info!(interval_ms = interval.as_millis() as u64, "pending watchdog started");

        Ok(Self {
            running,
            thread: Some(handle),
        })
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop and join the thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
            tracing::info!("pending watchdog stopped");
        }
    }
}

impl Drop for PendingWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(sm: Arc<AccelStateMachine>, running: Arc<AtomicBool>, interval: Duration) {
    while running.load(Ordering::Acquire) {
        thread::park_timeout(interval);
        if !running.load(Ordering::Acquire) {
            break;
        }

        let expired = sm.expire_stale_pending(Instant::now());
        if expired > 0 {
            tracing::warn!(expired, "forced stale pending attempts to transient failure");
        }
    }
}
