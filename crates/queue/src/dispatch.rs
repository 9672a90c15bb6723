//! Rate-limited dispatch queue.
//!
//! Guards every call to the chat platform API. A single worker hands tasks
//! off in FIFO order and keeps a log of the instants of the last dispatches;
//! a task is only dispatched when fewer than `max_per_second` dispatches
//! happened in the preceding second, so no rolling one-second window ever
//! holds more than the cap. Dispatched tasks run on their own spawned task:
//! the throttle bounds dispatch rate, not operation duration.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proofbot_common::AppResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::envelope::{AsyncEnvelope, TaskHandle};
use crate::signal::{ShutdownSignal, ShutdownTrigger, shutdown_pair};
use crate::stats::{QueueStats, QueueStatsSnapshot};

/// Queue name used in logs and statistics.
pub const DISPATCH_QUEUE: &str = "dispatch";

const WINDOW: Duration = Duration::from_secs(1);

/// Handle to the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<AsyncEnvelope>,
    max_per_second: Arc<AtomicU32>,
    stats: Arc<QueueStats>,
    next_id: AtomicU64,
    trigger: ShutdownTrigger,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Start the worker on the current tokio runtime.
    ///
    /// A cap of zero is raised to one.
    #[must_use]
    pub fn start(max_per_second: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (trigger, signal) = shutdown_pair();
        let max_per_second = Arc::new(AtomicU32::new(max_per_second.max(1)));
        let stats = Arc::new(QueueStats::new(DISPATCH_QUEUE));

        let worker = tokio::spawn(run_worker(
            rx,
            max_per_second.clone(),
            stats.clone(),
            signal,
        ));

        info!(
            queue = DISPATCH_QUEUE,
            max_per_second = max_per_second.load(Ordering::Relaxed),
            "Queue started"
        );

        Self {
            inner: Arc::new(Inner {
                tx,
                max_per_second,
                stats,
                next_id: AtomicU64::new(1),
                trigger,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Enqueue an operation. Returns immediately.
    ///
    /// The operation is not retried; a rate-limit rejection from the remote
    /// side surfaces through the handle and re-submission is up to the
    /// caller.
    pub fn submit<T, F, Fut>(&self, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (envelope, handle) = AsyncEnvelope::new(DISPATCH_QUEUE, id, None, op);
        self.inner.stats.record_submitted();

        if self.inner.trigger.is_triggered() {
            envelope.reject(&self.inner.stats);
        } else if let Err(mpsc::error::SendError(envelope)) = self.inner.tx.send(envelope) {
            envelope.reject(&self.inner.stats);
        }
        handle
    }

    /// Adjust the cap at runtime. Takes effect for the next dispatch.
    pub fn set_max_per_second(&self, max_per_second: u32) {
        let value = max_per_second.max(1);
        let previous = self.inner.max_per_second.swap(value, Ordering::Relaxed);
        if previous != value {
            info!(queue = DISPATCH_QUEUE, previous, current = value, "Dispatch cap changed");
        }
    }

    /// Current cap.
    #[must_use]
    pub fn max_per_second(&self) -> u32 {
        self.inner.max_per_second.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop the worker. Envelopes still queued resolve as closed; tasks
    /// already dispatched run to completion.
    pub async fn shutdown(&self) {
        self.inner.trigger.trigger();
        let worker = self
            .inner
            .worker
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(queue = DISPATCH_QUEUE, error = %e, "Worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<AsyncEnvelope>,
    max_per_second: Arc<AtomicU32>,
    stats: Arc<QueueStats>,
    mut signal: ShutdownSignal,
) {
    let mut recent: VecDeque<Instant> = VecDeque::new();

    'outer: loop {
        let envelope = tokio::select! {
            biased;
            () = signal.wait() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        loop {
            let now = Instant::now();
            while recent
                .front()
                .is_some_and(|&at| now.duration_since(at) >= WINDOW)
            {
                recent.pop_front();
            }

            let cap = max_per_second.load(Ordering::Relaxed) as usize;
            if recent.len() < cap {
                break;
            }

            // The oldest dispatch that must age out before one more fits.
            let wake = recent[recent.len() - cap] + WINDOW;
            debug!(
                queue = DISPATCH_QUEUE,
                task_id = envelope.id,
                wait_ms = wake.saturating_duration_since(now).as_millis() as u64,
                "Throttling"
            );

            tokio::select! {
                biased;
                () = signal.wait() => {
                    envelope.reject(&stats);
                    break 'outer;
                }
                () = sleep_until(wake) => {}
            }
        }

        recent.push_back(Instant::now());
        debug!(queue = DISPATCH_QUEUE, task_id = envelope.id, "Dispatching");

        let stats = stats.clone();
        tokio::spawn(async move {
            let id = envelope.id;
            if let Some(err) = envelope.run(&stats).await {
                debug!(queue = DISPATCH_QUEUE, task_id = id, error = %err, "Task failed");
            }
        });
    }

    rx.close();
    let mut rejected = 0_u64;
    while let Ok(envelope) = rx.try_recv() {
        envelope.reject(&stats);
        rejected += 1;
    }
    info!(queue = DISPATCH_QUEUE, rejected, "Queue stopped");
}
