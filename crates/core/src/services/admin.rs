//! Operator commands.

use serde::Serialize;
use tracing::{info, warn};

use proofbot_common::AppResult;

use crate::model::Participant;
use crate::services::persistence::Persistence;

/// Counts from a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Cached records removed.
    pub cache_records: usize,
    /// Durable rows removed.
    pub durable_rows: u64,
    /// Blob keys deleted.
    pub blobs: usize,
}

/// Both views of one participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    /// Row in the durable store.
    pub durable: Option<Participant>,
    /// Document in the local cache.
    pub cached: Option<Participant>,
}

impl ParticipantView {
    /// Whether the cache matches the durable row.
    #[must_use]
    pub fn in_sync(&self) -> bool {
        self.durable == self.cached
    }
}

/// Administrative operations over every store.
#[derive(Clone)]
pub struct AdminService {
    persistence: Persistence,
}

impl AdminService {
    /// Create the service.
    #[must_use]
    pub const fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    /// Durable and cached copy of a participant.
    pub async fn show(&self, id: &str) -> AppResult<ParticipantView> {
        crate::cache::validate_id(id)?;
        self.persistence.durable().ensure_schema().await?;
        Ok(ParticipantView {
            durable: self.persistence.durable().find(id).await?,
            cached: self.persistence.cache().load(id).await?,
        })
    }

    /// Wipe the cache, the durable table and the blob store.
    ///
    /// Every admin operation first ensures the durable table exists.
    pub async fn purge_all(&self) -> AppResult<PurgeReport> {
        self.persistence.durable().ensure_schema().await?;
        let cache_records = self.persistence.cache().clear().await?;
        let durable_rows = self.persistence.durable().truncate().await?;

        let blobs = self.persistence.blobs();
        let keys = blobs.list_keys().await?;
        let mut deleted = 0;
        for key in &keys {
            match blobs.delete(key).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to delete blob"),
            }
        }

        let report = PurgeReport {
            cache_records,
            durable_rows,
            blobs: deleted,
        };
        info!(?report, "Purged all stores");
        Ok(report)
    }

    /// Seed `count` synthetic participants through the normal write path
    /// and wait for their durable writes.
    pub async fn populate(&self, count: u32) -> AppResult<u32> {
        self.persistence.durable().ensure_schema().await?;
        let mut handles = Vec::with_capacity(count as usize);
        for n in 1..=count {
            let id = n.to_string();
            let written = self
                .persistence
                .update(&id, |p| {
                    if p.game_name.is_none() {
                        p.set_display_name(format!("display_name_{n}"));
                        p.set_game_name(format!("game_name_{n}"))?;
                    }
                    Ok(())
                })
                .await?;
            handles.push(written.durable);
        }

        let mut written = 0;
        for handle in handles {
            handle.await?;
            written += 1;
        }
        info!(written, "Populated participants");
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::testing::{FlakyBlobStore, MemoryStore};
    use proofbot_queue::{BLOB_QUEUE, DurableQueue, RELATIONAL_QUEUE, connection_gate};
    use std::sync::Arc;

    async fn admin() -> (tempfile::TempDir, Arc<MemoryStore>, Arc<FlakyBlobStore>, AdminService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let blobs = FlakyBlobStore::in_memory();
        let persistence = Persistence::new(
            Arc::new(LocalCache::open(dir.path()).await.unwrap()),
            store.clone(),
            blobs.clone(),
            DurableQueue::start(RELATIONAL_QUEUE, 2, connection_gate(2).unwrap()),
            DurableQueue::start(BLOB_QUEUE, 1, connection_gate(1).unwrap()),
        );
        (dir, store, blobs, AdminService::new(persistence))
    }

    #[tokio::test]
    async fn test_populate_then_show() {
        let (_dir, store, _blobs, admin) = admin().await;
        assert_eq!(admin.populate(5).await.unwrap(), 5);
        assert_eq!(store.len(), 5);

        let view = admin.show("3").await.unwrap();
        assert!(view.in_sync());
        assert_eq!(
            view.cached.unwrap().game_name.as_deref(),
            Some("game_name_3")
        );

        // Re-running does not trip the one-time game name rule.
        assert_eq!(admin.populate(5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_purge_all_empties_every_store() {
        let (_dir, store, blobs, admin) = admin().await;
        admin.populate(3).await.unwrap();
        blobs.insert("1_1.png", b"x");
        blobs.insert("2_1.png", b"y");

        let report = admin.purge_all().await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                cache_records: 3,
                durable_rows: 3,
                blobs: 2,
            }
        );
        assert_eq!(store.len(), 0);
        assert!(admin.show("1").await.unwrap().cached.is_none());
    }

    #[tokio::test]
    async fn test_every_operation_ensures_schema_first() {
        let (_dir, store, _blobs, admin) = admin().await;

        admin.show("1").await.unwrap();
        admin.purge_all().await.unwrap();
        admin.populate(1).await.unwrap();
        assert_eq!(store.schema_checks(), 3);

        store.fail_schema(true);
        assert!(admin.purge_all().await.is_err());
        assert!(admin.show("1").await.unwrap_err().is_server_error());
        store.fail_schema(false);
        assert!(admin.show("1").await.unwrap().cached.is_some());
    }

    #[tokio::test]
    async fn test_show_rejects_bad_id() {
        let (_dir, _store, _blobs, admin) = admin().await;
        assert!(admin.show("../x").await.is_err());
    }
}
