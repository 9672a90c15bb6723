//! CPU-bound offload queue.
//!
//! `W` dedicated OS threads pull jobs from one shared channel, so at most
//! `W` analysis tasks run at once while the async runtime keeps serving
//! I/O. Worker threads never touch a submitter's handle: they send a
//! completion message back to a single router task on the runtime, and the
//! router resolves the handle.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread;

use proofbot_common::{AppError, AppResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::{Completion, TaskError, TaskHandle, TaskOutput, completion, panic_message};
use crate::stats::{QueueStats, QueueStatsSnapshot};

/// Queue name used in logs and statistics.
pub const CPU_QUEUE: &str = "cpu";

type Job = Box<dyn FnOnce() -> AppResult<TaskOutput> + Send>;

struct CpuJob {
    id: u64,
    job: Job,
}

enum RouterMessage {
    Register { id: u64, completion: Completion },
    Done {
        id: u64,
        result: Result<TaskOutput, TaskError>,
    },
}

/// Handle to the CPU queue. Cheap to clone.
#[derive(Clone)]
pub struct CpuQueue {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Mutex<Option<std_mpsc::Sender<CpuJob>>>,
    router_tx: Mutex<Option<mpsc::UnboundedSender<RouterMessage>>>,
    closed: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
    next_id: AtomicU64,
    workers: usize,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl CpuQueue {
    /// Spawn `workers` threads and the completion router.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(workers: usize) -> AppResult<Self> {
        let workers = workers.max(1);
        let (jobs_tx, jobs_rx) = std_mpsc::channel::<CpuJob>();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(QueueStats::new(CPU_QUEUE));

        for index in 0..workers {
            let jobs_rx = jobs_rx.clone();
            let router_tx = router_tx.clone();
            let closed = closed.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(format!("proofbot-cpu-{index}"))
                .spawn(move || run_thread(&jobs_rx, &router_tx, &closed, &stats))
                .map_err(|e| AppError::Queue(format!("Failed to spawn CPU worker: {e}")))?;
        }

        let router = tokio::spawn(run_router(router_rx, stats.clone()));
        info!(queue = CPU_QUEUE, workers, "Queue started");

        Ok(Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(Some(jobs_tx)),
                router_tx: Mutex::new(Some(router_tx)),
                closed,
                stats,
                next_id: AtomicU64::new(1),
                workers,
                router: Mutex::new(Some(router)),
            }),
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Enqueue a blocking task. Returns immediately.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, handle) = completion::<T>(CPU_QUEUE);
        self.inner.stats.record_submitted();

        let job: Job = Box::new(move || task().map(|v| Box::new(v) as TaskOutput));

        let router_tx = self.inner.router_tx.lock().ok().and_then(|guard| guard.clone());
        let jobs = self.inner.jobs.lock().ok().and_then(|guard| guard.clone());
        let (Some(router_tx), Some(jobs)) = (router_tx, jobs) else {
            self.inner.stats.record_rejected();
            completion.reject();
            return handle;
        };

        // Registration must reach the router before the job can finish.
        if let Err(mpsc::error::SendError(message)) =
            router_tx.send(RouterMessage::Register { id, completion })
        {
            self.inner.stats.record_rejected();
            if let RouterMessage::Register { completion, .. } = message {
                completion.reject();
            }
            return handle;
        }

        // If the workers are gone the router rejects the registration when
        // it drains.
        let _ = jobs.send(CpuJob { id, job });
        handle
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop accepting work. Jobs not yet started resolve as closed; jobs
    /// already running finish first.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut jobs) = self.inner.jobs.lock() {
            jobs.take();
        }
        if let Ok(mut router_tx) = self.inner.router_tx.lock() {
            router_tx.take();
        }

        let router = self
            .inner
            .router
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(router) = router {
            if let Err(e) = router.await {
                warn!(queue = CPU_QUEUE, error = %e, "Router ended abnormally");
            }
        }
    }
}

fn run_thread(
    jobs: &Mutex<std_mpsc::Receiver<CpuJob>>,
    router: &mpsc::UnboundedSender<RouterMessage>,
    closed: &AtomicBool,
    stats: &QueueStats,
) {
    loop {
        let next = match jobs.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        let Ok(CpuJob { id, job }) = next else {
            break;
        };

        let result = if closed.load(Ordering::SeqCst) {
            stats.record_rejected();
            Err(TaskError::Closed { queue: CPU_QUEUE })
        } else {
            stats.record_started();
            let result = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(TaskError::Failed(err)),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            stats.record_finished(result.is_ok());
            result
        };

        if router.send(RouterMessage::Done { id, result }).is_err() {
            break;
        }
    }
}

async fn run_router(mut rx: mpsc::UnboundedReceiver<RouterMessage>, stats: Arc<QueueStats>) {
    let mut pending: HashMap<u64, Completion> = HashMap::new();

    while let Some(message) = rx.recv().await {
        match message {
            RouterMessage::Register { id, completion } => {
                pending.insert(id, completion);
            }
            RouterMessage::Done { id, result } => match pending.remove(&id) {
                Some(completion) => {
                    if let Err(err) = &result {
                        debug!(queue = CPU_QUEUE, task_id = id, error = %err, "Task failed");
                    }
                    completion.resolve(result);
                }
                None => warn!(queue = CPU_QUEUE, task_id = id, "Completion for unknown task"),
            },
        }
    }

    // Registered jobs that never reached a worker.
    let orphaned = pending.len();
    for (_, completion) in pending.drain() {
        stats.record_rejected();
        completion.reject();
    }
    info!(queue = CPU_QUEUE, rejected = orphaned, "Queue stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_runs_off_the_runtime_thread() {
        let queue = CpuQueue::start(1).unwrap();
        let name = queue
            .submit(|| Ok(thread::current().name().map(str::to_string)))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("proofbot-cpu-0"));
    }

    #[tokio::test]
    async fn test_panic_does_not_stop_worker() {
        let queue = CpuQueue::start(1).unwrap();

        let err = queue
            .submit::<(), _>(|| panic!("decoder exploded"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Panicked(msg) if msg.contains("decoder exploded")));

        assert_eq!(queue.submit(|| Ok(5)).await.unwrap(), 5);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let queue = CpuQueue::start(2).unwrap();
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                queue.submit(|| {
                    thread::sleep(Duration::from_millis(50));
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let queue = CpuQueue::start(1).unwrap();
        queue.shutdown().await;

        let err = queue.submit(|| Ok(1)).await.unwrap_err();
        assert!(err.is_closed());
    }
}
