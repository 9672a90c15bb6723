//! Durable-write queue.
//!
//! Two instances run in the server, one in front of the relational store
//! and one in front of the blob store. Each worker owns a shard with its
//! own channel and processes it strictly in order. Writes submitted with a
//! key always land on the same shard, so writes for one entity apply in
//! submission order regardless of the worker count. A gate semaphore,
//! sized independently of the workers, caps how many writes execute at
//! once against the backing store's connection pool.
//!
//! A failed write is logged at error level and reported through its
//! handle. Nothing is rolled back.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proofbot_common::{AppError, AppResult};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::{AsyncEnvelope, TaskHandle};
use crate::signal::{ShutdownSignal, ShutdownTrigger, shutdown_pair};
use crate::stats::{QueueStats, QueueStatsSnapshot};

/// Queue name of the relational instance.
pub const RELATIONAL_QUEUE: &str = "relational";

/// Queue name of the blob instance.
pub const BLOB_QUEUE: &str = "blob";

/// Handle to a durable-write queue. Cheap to clone.
#[derive(Clone)]
pub struct DurableQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    shards: Vec<mpsc::UnboundedSender<AsyncEnvelope>>,
    gate: Arc<Semaphore>,
    next_shard: AtomicUsize,
    next_id: AtomicU64,
    stats: Arc<QueueStats>,
    trigger: ShutdownTrigger,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DurableQueue {
    /// Start `workers` shard workers sharing `gate`.
    ///
    /// The gate is passed in so other users of the same backing store
    /// (recovery downloads) can share it.
    #[must_use]
    pub fn start(name: &'static str, workers: usize, gate: Arc<Semaphore>) -> Self {
        let workers = workers.max(1);
        let (trigger, signal) = shutdown_pair();
        let stats = Arc::new(QueueStats::new(name));

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(tx);
            handles.push(tokio::spawn(run_shard(
                name,
                shard,
                rx,
                gate.clone(),
                stats.clone(),
                signal.clone(),
            )));
        }

        info!(
            queue = name,
            workers,
            connections = gate.available_permits(),
            "Queue started"
        );

        Self {
            inner: Arc::new(Inner {
                name,
                shards,
                gate,
                next_shard: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                stats,
                trigger,
                workers: Mutex::new(handles),
            }),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// The concurrency gate in front of the backing store.
    #[must_use]
    pub fn gate(&self) -> Arc<Semaphore> {
        self.inner.gate.clone()
    }

    /// Enqueue a write with no ordering relation to other writes.
    pub fn submit<T, F, Fut>(&self, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let shard =
            self.inner.next_shard.fetch_add(1, Ordering::Relaxed) % self.inner.shards.len();
        self.enqueue(shard, None, op)
    }

    /// Enqueue a write for the entity `key`. Writes sharing a key run in
    /// submission order.
    pub fn submit_keyed<T, F, Fut>(&self, key: &str, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let shard = shard_for(key, self.inner.shards.len());
        self.enqueue(shard, Some(key.to_string()), op)
    }

    fn enqueue<T, F, Fut>(&self, shard: usize, key: Option<String>, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (envelope, handle) = AsyncEnvelope::new(self.inner.name, id, key, op);
        self.inner.stats.record_submitted();

        if self.inner.trigger.is_triggered() {
            envelope.reject(&self.inner.stats);
        } else if let Err(mpsc::error::SendError(envelope)) = self.inner.shards[shard].send(envelope)
        {
            envelope.reject(&self.inner.stats);
        }
        handle
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop the workers. A write already executing finishes; writes still
    /// queued resolve as closed.
    pub async fn shutdown(&self) {
        self.inner.trigger.trigger();
        let workers = self
            .inner
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(queue = self.inner.name, error = %e, "Worker ended abnormally");
            }
        }
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn run_shard(
    name: &'static str,
    shard: usize,
    mut rx: mpsc::UnboundedReceiver<AsyncEnvelope>,
    gate: Arc<Semaphore>,
    stats: Arc<QueueStats>,
    mut signal: ShutdownSignal,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            () = signal.wait() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            () = signal.wait() => {
                envelope.reject(&stats);
                break;
            }
            permit = gate.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            envelope.reject(&stats);
            break;
        };

        let id = envelope.id;
        let key = envelope.key.clone();
        debug!(queue = name, shard, task_id = id, key = ?key, "Writing");

        if let Some(err) = envelope.run(&stats).await {
            error!(
                queue = name,
                shard,
                task_id = id,
                key = ?key,
                error = %err,
                "Durable write failed"
            );
        }
    }

    rx.close();
    let mut rejected = 0_u64;
    while let Ok(envelope) = rx.try_recv() {
        envelope.reject(&stats);
        rejected += 1;
    }
    info!(queue = name, shard, rejected, "Shard stopped");
}

/// Build the gate for a backing store allowing `connections` concurrent
/// operations.
pub fn connection_gate(connections: usize) -> AppResult<Arc<Semaphore>> {
    if connections == 0 {
        return Err(AppError::Config(
            "connection gate must allow at least one operation".to_string(),
        ));
    }
    Ok(Arc::new(Semaphore::new(connections)))
}
