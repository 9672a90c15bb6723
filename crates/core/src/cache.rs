//! Local cache store.
//!
//! The fast path for reads and writes during normal operation. Each
//! participant is one pretty-printed JSON document under `records/`;
//! proof artifacts live under `artifacts/` with their blob key as file name.
//!
//! Read-modify-write goes through [`LocalCache::update`], which holds a
//! per-participant lock for the whole cycle so concurrent updates of the
//! same record cannot lose each other's changes. Locks for idle records are
//! dropped from the lock table as soon as their last holder releases them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use proofbot_common::{AppError, AppResult, validate_key};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::model::Participant;

const RECORDS_DIR: &str = "records";
const ARTIFACTS_DIR: &str = "artifacts";
const RECORD_EXT: &str = "json";

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Check that `id` is usable as a record file name.
pub fn validate_id(id: &str) -> AppResult<()> {
    if id.is_empty()
        || !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(AppError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Exclusive access to one participant's record.
pub struct EntityGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(&self.id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&self.id);
            }
        }
    }
}

/// Filesystem-backed participant cache.
pub struct LocalCache {
    root: PathBuf,
    records: PathBuf,
    artifacts: PathBuf,
    locks: LockTable,
}

impl LocalCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> AppResult<Self> {
        let root = dir.into();
        let cache = Self {
            records: root.join(RECORDS_DIR),
            artifacts: root.join(ARTIFACTS_DIR),
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
        };
        cache.ensure_dirs().await?;
        Ok(cache)
    }

    async fn ensure_dirs(&self) -> AppResult<()> {
        for dir in [&self.records, &self.artifacts] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                AppError::Cache(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> AppResult<PathBuf> {
        validate_id(id)?;
        Ok(self.records.join(format!("{id}.{RECORD_EXT}")))
    }

    /// Acquire the per-participant lock.
    pub async fn lock(&self, id: &str) -> AppResult<EntityGuard> {
        validate_id(id)?;
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| AppError::Internal("cache lock table poisoned".to_string()))?;
            locks.entry(id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        Ok(EntityGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    /// Number of live entries in the lock table.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    /// Load a record. A missing record is `None`.
    pub async fn load(&self, id: &str) -> AppResult<Option<Participant>> {
        let path = self.record_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Cache(format!("Failed to read record {id}: {e}"))),
        }
    }

    /// Load a record, or a fresh one (not yet saved) when absent.
    pub async fn load_or_init(&self, id: &str) -> AppResult<Participant> {
        Ok(self
            .load(id)
            .await?
            .unwrap_or_else(|| Participant::new(id)))
    }

    /// Write a record without taking its lock.
    ///
    /// Callers either hold the lock through [`LocalCache::lock`] or are the
    /// only writer (recovery before readiness).
    pub async fn save(&self, record: &Participant) -> AppResult<()> {
        let path = self.record_path(&record.id)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomically(&path, &bytes).await
    }

    /// Locked read-modify-write.
    ///
    /// `mutate` runs on the current record (or a fresh one). If it fails,
    /// nothing is written. Returns the saved record and `mutate`'s value.
    pub async fn update<F, R>(&self, id: &str, mutate: F) -> AppResult<(Participant, R)>
    where
        F: FnOnce(&mut Participant) -> AppResult<R>,
    {
        let (record, value, ()) = self.update_with(id, mutate, |_| ()).await?;
        Ok((record, value))
    }

    /// Like [`update`](Self::update), but runs `saved` on the new record
    /// before the entity lock is released.
    pub async fn update_with<F, R, S, T>(
        &self,
        id: &str,
        mutate: F,
        saved: S,
    ) -> AppResult<(Participant, R, T)>
    where
        F: FnOnce(&mut Participant) -> AppResult<R>,
        S: FnOnce(&Participant) -> T,
    {
        let _guard = self.lock(id).await?;
        let mut record = self.load_or_init(id).await?;
        let value = mutate(&mut record)?;
        self.save(&record).await?;
        let after = saved(&record);
        Ok((record, value, after))
    }

    /// Overwrite a record with a restored copy under its lock.
    pub async fn restore(&self, record: &Participant) -> AppResult<()> {
        let _guard = self.lock(&record.id).await?;
        self.save(record).await?;
        debug!(entity_id = %record.id, "Record restored into cache");
        Ok(())
    }

    /// Ids of every cached record, sorted.
    pub async fn ids(&self) -> AppResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.records).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Cache(format!("Failed to list records: {e}"))),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Cache(format!("Failed to list records: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a record. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> AppResult<bool> {
        let _guard = self.lock(id).await?;
        let path = self.record_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Cache(format!("Failed to remove record {id}: {e}"))),
        }
    }

    /// Delete every record and artifact. Returns the number of records
    /// removed.
    pub async fn clear(&self) -> AppResult<usize> {
        let removed = self.ids().await?.len();
        for dir in [&self.records, &self.artifacts] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AppError::Cache(format!(
                        "Failed to clear {}: {e}",
                        dir.display()
                    )));
                }
            }
        }
        self.ensure_dirs().await?;
        Ok(removed)
    }

    /// Local path of an artifact.
    pub fn artifact_path(&self, name: &str) -> AppResult<PathBuf> {
        validate_key(name)?;
        Ok(self.artifacts.join(name))
    }

    /// Whether an artifact is present locally.
    pub async fn has_artifact(&self, name: &str) -> bool {
        match self.artifact_path(name) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Store artifact bytes. Returns the local path.
    pub async fn write_artifact(&self, name: &str, bytes: &[u8]) -> AppResult<PathBuf> {
        let path = self.artifact_path(name)?;
        write_atomically(&path, bytes).await?;
        Ok(path)
    }

    /// Map of invited member id to `(invite code, inviter id)`, rebuilt
    /// from cached records.
    pub async fn invite_index(&self) -> AppResult<HashMap<String, (String, String)>> {
        let mut index = HashMap::new();
        for id in self.ids().await? {
            let Some(record) = self.load(&id).await? else {
                continue;
            };
            if let (Some(code), Some(inviter)) = (record.invite.used_code, record.invite.inviter_id)
            {
                index.insert(record.id, (code, inviter));
            }
        }
        Ok(index)
    }
}

async fn write_atomically(dest: &Path, bytes: &[u8]) -> AppResult<()> {
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| AppError::Cache(format!("Failed to write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| AppError::Cache(format!("Failed to move {} into place: {e}", dest.display())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ProofKind, Step};

    async fn open_cache() -> (tempfile::TempDir, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        (dir, cache)
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("123456789").is_ok());
        assert!(validate_id("user_1-a").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a b").is_err());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let (_dir, cache) = open_cache().await;
        assert!(cache.load("42").await.unwrap().is_none());
        let fresh = cache.load_or_init("42").await.unwrap();
        assert_eq!(fresh.step, Step::GameName);
        assert!(cache.load("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_persists_and_failed_update_writes_nothing() {
        let (_dir, cache) = open_cache().await;

        let (record, ()) = cache
            .update("42", |p| p.set_game_name("Ninja"))
            .await
            .unwrap();
        assert_eq!(record.step, Step::ImageProof);

        let err = cache.update("42", |p| p.set_game_name("Again")).await;
        assert!(err.is_err());
        let stored = cache.load("42").await.unwrap().unwrap();
        assert_eq!(stored.game_name.as_deref(), Some("Ninja"));
    }

    #[tokio::test]
    async fn test_update_with_runs_before_unlock() {
        let (_dir, cache) = open_cache().await;

        let (record, (), held) = cache
            .update_with(
                "42",
                |p| {
                    p.add_score(3);
                    Ok(())
                },
                |_| cache.held_locks(),
            )
            .await
            .unwrap();

        assert_eq!(record.score, 3);
        assert_eq!(held, 1);
        assert_eq!(cache.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let (_dir, cache) = open_cache().await;
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .update("42", |p| {
                            p.add_score(1);
                            Ok(())
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.load("42").await.unwrap().unwrap().score, 32);
        assert_eq!(cache.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_ids_clear_and_remove() {
        let (_dir, cache) = open_cache().await;
        for id in ["b", "a", "c"] {
            cache.save(&Participant::new(id)).await.unwrap();
        }
        cache.write_artifact("a_1.png", b"png").await.unwrap();
        assert_eq!(cache.ids().await.unwrap(), vec!["a", "b", "c"]);

        assert!(cache.remove("b").await.unwrap());
        assert!(!cache.remove("b").await.unwrap());

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(cache.ids().await.unwrap().is_empty());
        assert!(!cache.has_artifact("a_1.png").await);
    }

    #[tokio::test]
    async fn test_artifacts() {
        let (_dir, cache) = open_cache().await;
        let mut p = Participant::new("7");
        p.set_game_name("x").unwrap();
        let name = p.attach(ProofKind::Image, "https://cdn/img").unwrap();

        assert!(!cache.has_artifact(&name).await);
        let path = cache.write_artifact(&name, b"data").await.unwrap();
        assert!(cache.has_artifact(&name).await);
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"data");
        assert!(cache.artifact_path("../escape").is_err());
    }

    #[tokio::test]
    async fn test_invite_index() {
        let (_dir, cache) = open_cache().await;
        let mut member = Participant::new("member");
        member.set_invited_by("abc", "inviter");
        cache.save(&member).await.unwrap();
        cache.save(&Participant::new("loner")).await.unwrap();

        let index = cache.invite_index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get("member"),
            Some(&("abc".to_string(), "inviter".to_string()))
        );
    }
}
