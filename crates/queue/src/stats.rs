//! Per-queue counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters owned by one queue.
#[derive(Debug)]
pub struct QueueStats {
    name: &'static str,
    submitted: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of a queue's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    /// Queue name.
    pub queue: &'static str,
    /// Envelopes accepted by `submit`.
    pub submitted: u64,
    /// Tasks that returned a value.
    pub completed: u64,
    /// Tasks that returned an error or panicked.
    pub failed: u64,
    /// Envelopes resolved as closed without running.
    pub rejected: u64,
    /// Envelopes waiting for a worker.
    pub depth: u64,
    /// Tasks currently executing.
    pub in_flight: u64,
}

impl QueueStats {
    /// Create zeroed counters for the named queue.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            submitted: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Queue name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let started = self.started.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);

        QueueStatsSnapshot {
            queue: self.name,
            submitted,
            completed,
            failed,
            rejected,
            depth: submitted.saturating_sub(started + rejected),
            in_flight: started.saturating_sub(completed + failed),
        }
    }
}
