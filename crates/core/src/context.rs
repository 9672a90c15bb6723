//! Process-wide service context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use proofbot_common::{AppResult, Config, SharedBlobStore};
use proofbot_queue::{
    BLOB_QUEUE, CpuQueue, DispatchQueue, DurableQueue, QueueStatsSnapshot, RELATIONAL_QUEUE,
    connection_gate,
};
use tracing::info;

use crate::cache::LocalCache;
use crate::recovery::{RecoveryCoordinator, RecoveryReport};
use crate::services::{
    AdminService, ArtifactSource, DigestVerifier, HttpArtifactSource, Persistence,
    PlatformGateway, ProofService, SharedDurableStore,
};

const ARTIFACT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the process shares, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Local cache.
    pub cache: Arc<LocalCache>,
    /// Durable participant store.
    pub durable: SharedDurableStore,
    /// Blob store for artifacts.
    pub blobs: SharedBlobStore,
    /// Platform dispatch queue.
    pub dispatch: DispatchQueue,
    /// CPU-bound analysis queue.
    pub cpu: CpuQueue,
    /// Relational write queue.
    pub relational: DurableQueue,
    /// Blob transfer queue.
    pub blob_queue: DurableQueue,
    /// Cache-first persistence.
    pub persistence: Persistence,
    /// Proof intake.
    pub proofs: ProofService,
    /// Platform API access; `None` without a bot token.
    pub gateway: Option<PlatformGateway>,
    /// Maintenance operations.
    pub admin: AdminService,
    ready: Arc<AtomicBool>,
}

impl AppContext {
    /// Build the context with the HTTP artifact source.
    pub async fn build(
        config: Config,
        durable: SharedDurableStore,
        blobs: SharedBlobStore,
    ) -> AppResult<Self> {
        let source = Arc::new(HttpArtifactSource::new(ARTIFACT_FETCH_TIMEOUT)?);
        Self::build_with_source(config, durable, blobs, source).await
    }

    /// Build the context with a custom artifact source.
    ///
    /// Must be called inside a Tokio runtime; the queues start immediately.
    pub async fn build_with_source(
        config: Config,
        durable: SharedDurableStore,
        blobs: SharedBlobStore,
        source: Arc<dyn ArtifactSource>,
    ) -> AppResult<Self> {
        config.validate()?;
        let queues = &config.queues;

        let cache = Arc::new(LocalCache::open(&config.cache.dir).await?);

        let dispatch = DispatchQueue::start(queues.dispatch_per_second);
        let cpu = CpuQueue::start(queues.cpu_workers)?;
        let relational = DurableQueue::start(
            RELATIONAL_QUEUE,
            queues.relational_workers,
            connection_gate(queues.relational_connections)?,
        );
        let blob_queue = DurableQueue::start(
            BLOB_QUEUE,
            queues.blob_workers,
            connection_gate(queues.blob_connections)?,
        );

        let persistence = Persistence::new(
            cache.clone(),
            durable.clone(),
            blobs.clone(),
            relational.clone(),
            blob_queue.clone(),
        );
        let proofs = ProofService::new(
            persistence.clone(),
            source,
            Arc::new(DigestVerifier),
            cpu.clone(),
        );
        let gateway = PlatformGateway::from_config(&config.platform, dispatch.clone())?;
        if gateway.is_none() {
            info!("No platform token configured; gateway disabled");
        }
        let admin = AdminService::new(persistence.clone());

        Ok(Self {
            config: Arc::new(config),
            cache,
            durable,
            blobs,
            dispatch,
            cpu,
            relational,
            blob_queue,
            persistence,
            proofs,
            gateway,
            admin,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Recovery coordinator sharing the blob queue's gate.
    #[must_use]
    pub fn recovery(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(
            self.durable.clone(),
            self.cache.clone(),
            self.blobs.clone(),
            self.blob_queue.gate(),
            self.config.recovery.page_size,
        )
    }

    /// Run startup recovery, or skip it when configured, then mark ready.
    pub async fn start(&self) -> AppResult<Option<RecoveryReport>> {
        let report = if self.config.recovery.skip {
            let cached = self.cache.ids().await?.len();
            info!(cached, "Recovery skipped; serving from existing cache");
            None
        } else {
            Some(self.recovery().run().await?)
        };
        self.mark_ready();
        Ok(report)
    }

    /// Whether work is being admitted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Start admitting work.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        info!("Ready");
    }

    /// Counters for every queue.
    #[must_use]
    pub fn stats(&self) -> Vec<QueueStatsSnapshot> {
        vec![
            self.dispatch.stats(),
            self.cpu.stats(),
            self.relational.stats(),
            self.blob_queue.stats(),
        ]
    }

    /// Stop admitting work and drain every queue.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.dispatch.shutdown().await;
        self.cpu.shutdown().await;
        self.relational.shutdown().await;
        self.blob_queue.shutdown().await;
        info!("All queues stopped");
    }
}
