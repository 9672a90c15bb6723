//! Startup recovery.
//!
//! Before any work is admitted the local cache is rebuilt from the durable
//! store, page by page in id order. Every pending proof whose artifact is
//! missing locally is downloaded again from the blob store. Downloads share
//! the blob store's connection gate with ordinary uploads and keep running
//! after [`RecoveryCoordinator::run`] returns; readiness means the cache is
//! populated, not that every download finished.
//!
//! Each participant moves `Unseen → Restored → (Complete | Repairing)`, and
//! `Repairing → Complete` once every pending artifact is present.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use proofbot_common::{AppError, AppResult, SharedBlobStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{LocalCache, validate_id};
use crate::services::durable::SharedDurableStore;

/// Recovery state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    /// Not reached by the scan yet.
    Unseen,
    /// Written to the cache; artifacts not checked yet.
    Restored,
    /// Waiting for artifact downloads.
    Repairing,
    /// Every pending artifact is present locally.
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct EntityProgress {
    state: RecoveryState,
    outstanding: usize,
}

/// Per-participant recovery states.
#[derive(Debug, Default)]
pub struct RecoveryProgress {
    entities: Mutex<HashMap<String, EntityProgress>>,
}

impl RecoveryProgress {
    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, EntityProgress>) -> R) -> Option<R> {
        self.entities.lock().ok().map(|mut entities| f(&mut entities))
    }

    /// Current state of `id`.
    #[must_use]
    pub fn state(&self, id: &str) -> RecoveryState {
        self.with(|entities| entities.get(id).map(|p| p.state))
            .flatten()
            .unwrap_or(RecoveryState::Unseen)
    }

    /// Number of participants in each state.
    #[must_use]
    pub fn counts(&self) -> HashMap<RecoveryState, usize> {
        self.with(|entities| {
            let mut counts = HashMap::new();
            for progress in entities.values() {
                *counts.entry(progress.state).or_insert(0) += 1;
            }
            counts
        })
        .unwrap_or_default()
    }

    fn reset(&self) {
        self.with(HashMap::clear);
    }

    fn restored(&self, id: &str) {
        self.with(|entities| {
            entities.insert(
                id.to_string(),
                EntityProgress {
                    state: RecoveryState::Restored,
                    outstanding: 0,
                },
            );
        });
    }

    fn checked(&self, id: &str, missing: usize) {
        self.with(|entities| {
            if let Some(progress) = entities.get_mut(id) {
                progress.outstanding = missing;
                progress.state = if missing == 0 {
                    RecoveryState::Complete
                } else {
                    RecoveryState::Repairing
                };
            }
        });
    }

    fn repaired(&self, id: &str) {
        self.with(|entities| {
            if let Some(progress) = entities.get_mut(id) {
                progress.outstanding = progress.outstanding.saturating_sub(1);
                if progress.outstanding == 0 {
                    progress.state = RecoveryState::Complete;
                }
            }
        });
    }
}

/// Result of one artifact download.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// Owning participant.
    pub entity_id: String,
    /// Artifact name / blob key.
    pub artifact: String,
    /// Bytes written, or why the download failed.
    pub result: Result<u64, AppError>,
}

/// Downloads still running after the scan.
#[derive(Debug, Default)]
pub struct RepairHandle {
    tasks: Vec<(String, String, JoinHandle<RepairOutcome>)>,
}

impl RepairHandle {
    /// Number of downloads scheduled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing was scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every download.
    pub async fn wait(self) -> Vec<RepairOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for (entity_id, artifact, task) in self.tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => RepairOutcome {
                    entity_id,
                    artifact,
                    result: Err(AppError::Internal(format!("Repair task failed: {e}"))),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Summary of a recovery pass.
#[derive(Debug)]
pub struct RecoveryReport {
    /// Records written to the cache.
    pub restored: usize,
    /// Rows skipped because their id is unusable as a cache key.
    pub skipped: usize,
    /// Artifact downloads scheduled.
    pub scheduled: usize,
    /// The scheduled downloads.
    pub repairs: RepairHandle,
}

/// Rebuilds the cache from the durable stores.
pub struct RecoveryCoordinator {
    durable: SharedDurableStore,
    cache: Arc<LocalCache>,
    blobs: SharedBlobStore,
    blob_gate: Arc<Semaphore>,
    page_size: u64,
    progress: Arc<RecoveryProgress>,
}

impl RecoveryCoordinator {
    /// Create a coordinator. `blob_gate` is the blob queue's gate.
    #[must_use]
    pub fn new(
        durable: SharedDurableStore,
        cache: Arc<LocalCache>,
        blobs: SharedBlobStore,
        blob_gate: Arc<Semaphore>,
        page_size: u64,
    ) -> Self {
        Self {
            durable,
            cache,
            blobs,
            blob_gate,
            page_size: page_size.max(1),
            progress: Arc::new(RecoveryProgress::default()),
        }
    }

    /// Per-participant progress of the latest pass.
    #[must_use]
    pub fn progress(&self) -> Arc<RecoveryProgress> {
        self.progress.clone()
    }

    /// Run one recovery pass.
    ///
    /// Fails if the durable store is unreachable, the schema cannot be
    /// ensured, or the cache cannot be written. Download failures are only
    /// logged and reported through the repair outcomes.
    pub async fn run(&self) -> AppResult<RecoveryReport> {
        self.progress.reset();
        self.durable
            .ensure_schema()
            .await
            .map_err(|e| AppError::Recovery(format!("Schema check failed: {e}")))?;

        let mut after: Option<String> = None;
        let mut restored = 0;
        let mut skipped = 0;
        let mut repairs = RepairHandle::default();

        loop {
            let page = self
                .durable
                .fetch_page(after.as_deref(), self.page_size)
                .await
                .map_err(|e| AppError::Recovery(format!("Durable scan failed: {e}")))?;
            let page_len = page.len() as u64;
            let Some(last) = page.last().map(|r| r.id.clone()) else {
                break;
            };

            for record in page {
                if let Err(e) = validate_id(&record.id) {
                    warn!(entity_id = %record.id, error = %e, "Skipping row with unusable id");
                    skipped += 1;
                    continue;
                }

                self.cache
                    .restore(&record)
                    .await
                    .map_err(|e| AppError::Recovery(format!("Cache write failed: {e}")))?;
                self.progress.restored(&record.id);
                restored += 1;

                let mut missing = Vec::new();
                for proof in record.pending_proofs() {
                    if !self.cache.has_artifact(&proof.artifact).await {
                        missing.push(proof.artifact.clone());
                    }
                }
                self.progress.checked(&record.id, missing.len());

                for artifact in missing {
                    let task = tokio::spawn(repair_artifact(
                        record.id.clone(),
                        artifact.clone(),
                        self.cache.clone(),
                        self.blobs.clone(),
                        self.blob_gate.clone(),
                        self.progress.clone(),
                    ));
                    repairs.tasks.push((record.id.clone(), artifact, task));
                }
            }

            if page_len < self.page_size {
                break;
            }
            after = Some(last);
        }

        let scheduled = repairs.len();
        info!(restored, skipped, scheduled, "Recovery scan complete");

        Ok(RecoveryReport {
            restored,
            skipped,
            scheduled,
            repairs,
        })
    }
}

async fn repair_artifact(
    entity_id: String,
    artifact: String,
    cache: Arc<LocalCache>,
    blobs: SharedBlobStore,
    gate: Arc<Semaphore>,
    progress: Arc<RecoveryProgress>,
) -> RepairOutcome {
    let result = async {
        let dest = cache.artifact_path(&artifact)?;
        let _permit = gate
            .acquire_owned()
            .await
            .map_err(|_| AppError::Queue("blob gate closed".to_string()))?;
        blobs.get_to_file(&artifact, &dest).await
    }
    .await;

    match &result {
        Ok(bytes) => {
            progress.repaired(&entity_id);
            debug!(entity_id = %entity_id, artifact = %artifact, bytes, "Artifact restored");
        }
        Err(e) => {
            warn!(entity_id = %entity_id, artifact = %artifact, error = %e, "Artifact restore failed");
        }
    }

    RepairOutcome {
        entity_id,
        artifact,
        result,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Participant, ProofKind};
    use crate::services::durable::DurableStore;
    use crate::testing::{FlakyBlobStore, MemoryStore};

    fn pending_image(id: &str) -> Participant {
        let mut p = Participant::new(id);
        p.set_game_name(format!("gn-{id}")).unwrap();
        p.attach(ProofKind::Image, "https://cdn/x.png").unwrap();
        p
    }

    async fn coordinator(
        store: Arc<MemoryStore>,
        blobs: Arc<FlakyBlobStore>,
        page_size: u64,
    ) -> (tempfile::TempDir, Arc<LocalCache>, RecoveryCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LocalCache::open(dir.path()).await.unwrap());
        let coordinator = RecoveryCoordinator::new(
            store,
            cache.clone(),
            blobs,
            Arc::new(Semaphore::new(1)),
            page_size,
        );
        (dir, cache, coordinator)
    }

    #[tokio::test]
    async fn test_schema_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.fail_schema(true);
        let (_dir, _cache, coordinator) =
            coordinator(store, FlakyBlobStore::in_memory(), 10).await;

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, AppError::Recovery(_)));
    }

    #[tokio::test]
    async fn test_pages_through_every_row() {
        let store = Arc::new(MemoryStore::new());
        for n in 0..7 {
            store.insert(Participant::new(format!("p{n}")));
        }
        let (_dir, cache, coordinator) = coordinator(store, FlakyBlobStore::in_memory(), 3).await;

        let report = coordinator.run().await.unwrap();
        assert_eq!(report.restored, 7);
        assert_eq!(report.scheduled, 0);
        assert_eq!(cache.ids().await.unwrap().len(), 7);
        assert_eq!(
            coordinator.progress().counts().get(&RecoveryState::Complete),
            Some(&7)
        );
    }

    #[tokio::test]
    async fn test_failed_download_leaves_entity_repairing() {
        let store = Arc::new(MemoryStore::new());
        store.insert(pending_image("1"));
        store.insert(pending_image("2"));
        let blobs = FlakyBlobStore::in_memory();
        blobs.insert("2_1.png", b"ok");
        blobs.fail_key("1_1.png");
        let (_dir, cache, coordinator) = coordinator(store, blobs, 10).await;

        let report = coordinator.run().await.unwrap();
        assert_eq!(report.scheduled, 2);
        let outcomes = report.repairs.wait().await;

        let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].entity_id, "1");

        let progress = coordinator.progress();
        assert_eq!(progress.state("1"), RecoveryState::Repairing);
        assert_eq!(progress.state("2"), RecoveryState::Complete);
        assert_eq!(progress.state("3"), RecoveryState::Unseen);
        assert!(cache.has_artifact("2_1.png").await);
    }

    #[tokio::test]
    async fn test_present_artifact_is_not_downloaded() {
        let store = Arc::new(MemoryStore::new());
        store.insert(pending_image("1"));
        let (_dir, cache, coordinator) = coordinator(store, FlakyBlobStore::in_memory(), 10).await;
        cache.write_artifact("1_1.png", b"local").await.unwrap();

        let report = coordinator.run().await.unwrap();
        assert_eq!(report.scheduled, 0);
        assert_eq!(coordinator.progress().state("1"), RecoveryState::Complete);
    }

    #[tokio::test]
    async fn test_second_pass_forgets_deleted_rows() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Participant::new("gone"));
        store.insert(Participant::new("kept"));
        let (_dir, _cache, coordinator) =
            coordinator(store.clone(), FlakyBlobStore::in_memory(), 10).await;

        coordinator.run().await.unwrap();
        assert_eq!(coordinator.progress().state("gone"), RecoveryState::Complete);

        store.truncate().await.unwrap();
        store.insert(Participant::new("kept"));
        coordinator.run().await.unwrap();

        let progress = coordinator.progress();
        assert_eq!(progress.state("gone"), RecoveryState::Unseen);
        assert_eq!(progress.state("kept"), RecoveryState::Complete);
        assert_eq!(progress.counts().get(&RecoveryState::Complete), Some(&1));
    }

    #[tokio::test]
    async fn test_bad_id_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Participant::new("../../etc"));
        store.insert(Participant::new("ok"));
        let (_dir, _cache, coordinator) = coordinator(store, FlakyBlobStore::in_memory(), 10).await;

        let report = coordinator.run().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.skipped, 1);
    }
}
