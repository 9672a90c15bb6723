//! Write-through persistence.
//!
//! Every change is applied to the local cache first, under the
//! participant's lock, and then a full-row upsert is queued on the
//! relational queue keyed by participant id. The caller gets the new
//! record immediately and may await the durable write through its handle.
//! A failed durable write does not roll back the cache.

use std::sync::Arc;

use proofbot_common::{AppResult, SharedBlobStore, StoredBlob};
use proofbot_queue::{DurableQueue, TaskHandle};

use crate::cache::LocalCache;
use crate::model::Participant;
use crate::services::durable::SharedDurableStore;

/// Result of a cache write with its queued durable write.
pub struct Written<R> {
    /// Record as saved in the cache.
    pub record: Participant,
    /// Value returned by the mutation.
    pub value: R,
    /// Durable upsert of `record`.
    pub durable: TaskHandle<()>,
}

/// Cache-first persistence with queued durable writes.
#[derive(Clone)]
pub struct Persistence {
    cache: Arc<LocalCache>,
    durable: SharedDurableStore,
    blobs: SharedBlobStore,
    relational: DurableQueue,
    blob_queue: DurableQueue,
}

impl Persistence {
    /// Create the persistence layer.
    #[must_use]
    pub fn new(
        cache: Arc<LocalCache>,
        durable: SharedDurableStore,
        blobs: SharedBlobStore,
        relational: DurableQueue,
        blob_queue: DurableQueue,
    ) -> Self {
        Self {
            cache,
            durable,
            blobs,
            relational,
            blob_queue,
        }
    }

    /// The local cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// The durable store.
    #[must_use]
    pub fn durable(&self) -> &SharedDurableStore {
        &self.durable
    }

    /// The blob store.
    #[must_use]
    pub fn blobs(&self) -> &SharedBlobStore {
        &self.blobs
    }

    /// Read a participant from the cache.
    pub async fn get(&self, id: &str) -> AppResult<Option<Participant>> {
        self.cache.load(id).await
    }

    /// Locked read-modify-write of the cache followed by a queued upsert.
    ///
    /// The upsert is queued before the entity lock is released, so durable
    /// writes for one id keep the order of the cache writes.
    pub async fn update<F, R>(&self, id: &str, mutate: F) -> AppResult<Written<R>>
    where
        F: FnOnce(&mut Participant) -> AppResult<R>,
    {
        let (record, value, durable) = self
            .cache
            .update_with(id, mutate, |record| self.persist(record))
            .await?;
        Ok(Written {
            record,
            value,
            durable,
        })
    }

    /// Queue an upsert of the full row image of `record`.
    ///
    /// Callers must have saved `record` to the cache under its lock.
    pub fn persist(&self, record: &Participant) -> TaskHandle<()> {
        let store = self.durable.clone();
        let snapshot = record.clone();
        self.relational
            .submit_keyed(&record.id, move || async move { store.upsert(&snapshot).await })
    }

    /// Queue an upload of the local artifact `name` to the blob store.
    pub fn mirror_artifact(&self, entity_id: &str, name: &str) -> AppResult<TaskHandle<StoredBlob>> {
        let path = self.cache.artifact_path(name)?;
        let blobs = self.blobs.clone();
        let key = name.to_string();
        Ok(self
            .blob_queue
            .submit_keyed(entity_id, move || async move { blobs.put_file(&key, &path).await }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{FlakyBlobStore, MemoryStore};
    use proofbot_common::{AppError, BlobStore};
    use proofbot_queue::{BLOB_QUEUE, RELATIONAL_QUEUE, connection_gate};

    async fn setup(
        store: Arc<MemoryStore>,
        blobs: SharedBlobStore,
    ) -> (tempfile::TempDir, Persistence) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LocalCache::open(dir.path().join("cache")).await.unwrap());
        let persistence = Persistence::new(
            cache,
            store,
            blobs,
            DurableQueue::start(RELATIONAL_QUEUE, 2, connection_gate(1).unwrap()),
            DurableQueue::start(BLOB_QUEUE, 1, connection_gate(1).unwrap()),
        );
        (dir, persistence)
    }

    #[tokio::test]
    async fn test_update_writes_cache_then_durable() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, persistence) = setup(store.clone(), FlakyBlobStore::in_memory()).await;

        let written = persistence
            .update("42", |p| p.set_game_name("Ninja"))
            .await
            .unwrap();
        assert_eq!(
            persistence.get("42").await.unwrap().unwrap().game_name,
            written.record.game_name
        );

        written.durable.await.unwrap();
        assert_eq!(store.get("42").unwrap(), written.record);
    }

    #[tokio::test]
    async fn test_last_write_wins_per_entity() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, persistence) = setup(store.clone(), FlakyBlobStore::in_memory()).await;

        let mut handles = Vec::new();
        for score in 1..=3 {
            let written = persistence
                .update("A", move |p| {
                    p.score = score;
                    Ok(())
                })
                .await
                .unwrap();
            handles.push(written.durable);
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("A").unwrap().score, 3);
    }

    #[tokio::test]
    async fn test_durable_failure_keeps_cache() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let (_dir, persistence) = setup(store.clone(), FlakyBlobStore::in_memory()).await;

        let written = persistence
            .update("42", |p| {
                p.add_score(5);
                Ok(())
            })
            .await
            .unwrap();

        let err = written.durable.await.unwrap_err();
        assert!(matches!(AppError::from(err), AppError::Database(_)));
        assert_eq!(persistence.get("42").await.unwrap().unwrap().score, 5);
        assert!(store.get("42").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_updates_leave_durable_row_on_latest_image() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, persistence) = setup(store.clone(), FlakyBlobStore::in_memory()).await;

        for round in 0..20 {
            let id = format!("A{round}");
            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let persistence = persistence.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        persistence
                            .update(&id, |p| {
                                p.add_score(1);
                                Ok(())
                            })
                            .await
                            .unwrap()
                            .durable
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().await.unwrap();
            }

            let cached = persistence.get(&id).await.unwrap().unwrap();
            assert_eq!(cached.score, 16);
            assert_eq!(store.get(&id).unwrap(), cached);
        }
    }

    #[tokio::test]
    async fn test_mirror_artifact_uploads() {
        let blobs = FlakyBlobStore::in_memory();
        let (_dir, persistence) = setup(Arc::new(MemoryStore::new()), blobs.clone()).await;

        persistence
            .cache()
            .write_artifact("42_1.png", b"image")
            .await
            .unwrap();
        let stored = persistence
            .mirror_artifact("42", "42_1.png")
            .unwrap()
            .await
            .unwrap();

        assert_eq!(stored.size, 5);
        assert!(blobs.exists("42_1.png").await.unwrap());
    }
}
