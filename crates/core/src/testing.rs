//! In-memory doubles for the external stores.
//!
//! Used by this crate's tests and by downstream integration tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use proofbot_common::{AppError, AppResult, BlobStore, StoredBlob, validate_key};

use crate::model::Participant;
use crate::services::durable::DurableStore;
use crate::services::proofs::ArtifactSource;

fn poisoned() -> AppError {
    AppError::Internal("test double lock poisoned".to_string())
}

/// [`DurableStore`] backed by an ordered map.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, Participant>>,
    fail_writes: AtomicBool,
    fail_schema: AtomicBool,
    upserts: AtomicUsize,
    schema_checks: AtomicUsize,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly.
    pub fn insert(&self, record: Participant) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.insert(record.id.clone(), record);
        }
    }

    /// Current row for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Participant> {
        self.rows.lock().ok().and_then(|rows| rows.get(id).cloned())
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upserts applied so far.
    #[must_use]
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Make every upsert fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make schema creation fail, as with an unreachable database.
    pub fn fail_schema(&self, fail: bool) {
        self.fail_schema.store(fail, Ordering::SeqCst);
    }

    /// Number of `ensure_schema` calls so far.
    #[must_use]
    pub fn schema_checks(&self) -> usize {
        self.schema_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn ensure_schema(&self) -> AppResult<()> {
        self.schema_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_schema.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection refused".to_string()));
        }
        Ok(())
    }

    async fn fetch_page(&self, after: Option<&str>, limit: u64) -> AppResult<Vec<Participant>> {
        let rows = self.rows.lock().map_err(|_| poisoned())?;
        let page = match after {
            Some(after) => rows
                .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit as usize)
                .map(|(_, r)| r.clone())
                .collect(),
            None => rows.values().take(limit as usize).cloned().collect(),
        };
        Ok(page)
    }

    async fn upsert(&self, record: &Participant) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Database("write rejected".to_string()));
        }
        self.rows
            .lock()
            .map_err(|_| poisoned())?
            .insert(record.id.clone(), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find(&self, id: &str) -> AppResult<Option<Participant>> {
        Ok(self.get(id))
    }

    async fn truncate(&self) -> AppResult<u64> {
        let mut rows = self.rows.lock().map_err(|_| poisoned())?;
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }
}

/// In-memory [`BlobStore`] with per-key failure injection, a download
/// delay and a record of peak concurrent downloads.
#[derive(Default)]
pub struct FlakyBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    get_delay: Mutex<Duration>,
    active_gets: AtomicUsize,
    peak_gets: AtomicUsize,
}

impl FlakyBlobStore {
    /// An empty store behind an `Arc`.
    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an object.
    pub fn insert(&self, key: &str, bytes: &[u8]) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), bytes.to_vec());
        }
    }

    /// Make every operation on `key` fail.
    pub fn fail_key(&self, key: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(key.to_string());
        }
    }

    /// Delay each download by `delay`.
    pub fn set_get_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.get_delay.lock() {
            *current = delay;
        }
    }

    /// Highest number of downloads observed running at once.
    #[must_use]
    pub fn peak_concurrent_gets(&self) -> usize {
        self.peak_gets.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> AppResult<()> {
        validate_key(key)?;
        let failing = self.failing.lock().map_err(|_| poisoned())?;
        if failing.contains(key) {
            return Err(AppError::Storage(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put_file(&self, key: &str, source: &Path) -> AppResult<StoredBlob> {
        self.check(key)?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read {}: {e}", source.display())))?;
        let stored = StoredBlob {
            key: key.to_string(),
            size: data.len() as u64,
            md5: format!("{:x}", md5::compute(&data)),
        };
        self.objects
            .lock()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), data);
        Ok(stored)
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> AppResult<u64> {
        self.check(key)?;
        let now = self.active_gets.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_gets.fetch_max(now, Ordering::SeqCst);

        let delay = self.get_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let data = self
            .objects
            .lock()
            .map_err(|_| poisoned())
            .map(|objects| objects.get(key).cloned());
        self.active_gets.fetch_sub(1, Ordering::SeqCst);

        let data = data?.ok_or_else(|| AppError::NotFound(format!("Blob {key}")))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(e.to_string()))?;
        }
        tokio::fs::write(dest, &data)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;
        Ok(data.len() as u64)
    }

    async fn list_keys(&self) -> AppResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.check(key)?;
        self.objects
            .lock()
            .map_err(|_| poisoned())?
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(self
            .objects
            .lock()
            .map_err(|_| poisoned())?
            .contains_key(key))
    }
}

/// [`ArtifactSource`] returning the same bytes for every URL.
pub struct StaticSource {
    bytes: Bytes,
    fetches: AtomicUsize,
}

impl StaticSource {
    /// Serve `bytes`.
    #[must_use]
    pub fn new(bytes: &'static [u8]) -> Self {
        Self {
            bytes: Bytes::from_static(bytes),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of fetches served.
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for StaticSource {
    async fn fetch(&self, _url: &str) -> AppResult<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.bytes.clone())
    }
}
