//! Proof intake and verification.
//!
//! A submission is fetched from its source URL, stored as a local artifact,
//! attached to the participant, persisted, and mirrored to the blob store.
//! The participant's lock is held from validation until the record is
//! saved, so a rejected concurrent submission can never overwrite the
//! artifact of an accepted one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use proofbot_common::{AppError, AppResult, StoredBlob};
use proofbot_queue::{CpuQueue, TaskHandle};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::model::{Participant, ProofKind, ProofStatus};
use crate::services::persistence::{Persistence, Written};

/// Where submitted proofs are downloaded from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch the bytes behind `url`.
    async fn fetch(&self, url: &str) -> AppResult<Bytes>;
}

/// [`ArtifactSource`] over HTTP.
#[derive(Clone)]
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    /// Create a source with a request timeout.
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("proofbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch(&self, url: &str) -> AppResult<Bytes> {
        url::Url::parse(url)
            .map_err(|e| AppError::ExternalService(format!("Invalid proof URL {url}: {e}")))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Failed to fetch {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "Fetching {url} returned {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| AppError::ExternalService(format!("Failed to read {url}: {e}")))
    }
}

/// Outcome of analysing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Content fingerprint.
    pub fingerprint: String,
    /// Artifact size in bytes.
    pub size: u64,
}

/// CPU-bound artifact analysis. Runs on the CPU queue's threads.
pub trait ProofVerifier: Send + Sync {
    /// Analyse the artifact bytes.
    fn verify(&self, bytes: &[u8]) -> AppResult<Verdict>;
}

/// Fingerprints artifacts with SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

impl ProofVerifier for DigestVerifier {
    fn verify(&self, bytes: &[u8]) -> AppResult<Verdict> {
        if bytes.is_empty() {
            return Err(AppError::Conflict("Artifact is empty".to_string()));
        }
        Ok(Verdict {
            fingerprint: hex::encode(Sha256::digest(bytes)),
            size: bytes.len() as u64,
        })
    }
}

/// An accepted submission.
pub struct Submission {
    /// Record after the proof was attached.
    pub record: Participant,
    /// Artifact name (local file and blob key).
    pub artifact: String,
    /// Durable upsert of the record.
    pub durable: TaskHandle<()>,
    /// Blob upload of the artifact.
    pub mirror: TaskHandle<StoredBlob>,
}

/// Proof intake service.
#[derive(Clone)]
pub struct ProofService {
    persistence: Persistence,
    source: Arc<dyn ArtifactSource>,
    verifier: Arc<dyn ProofVerifier>,
    cpu: CpuQueue,
}

impl ProofService {
    /// Create the service.
    #[must_use]
    pub fn new(
        persistence: Persistence,
        source: Arc<dyn ArtifactSource>,
        verifier: Arc<dyn ProofVerifier>,
        cpu: CpuQueue,
    ) -> Self {
        Self {
            persistence,
            source,
            verifier,
            cpu,
        }
    }

    /// Accept a proof of `kind` for participant `id`.
    pub async fn submit(&self, id: &str, kind: ProofKind, source_url: &str) -> AppResult<Submission> {
        let cache = self.persistence.cache();
        let guard = cache.lock(id).await?;

        let mut record = cache.load_or_init(id).await?;
        let artifact = record.attach(kind, source_url)?;

        let bytes = self.source.fetch(source_url).await?;
        cache.write_artifact(&artifact, &bytes).await?;
        cache.save(&record).await?;

        let durable = self.persistence.persist(&record);
        drop(guard);

        let mirror = self.persistence.mirror_artifact(id, &artifact)?;
        info!(entity_id = id, artifact = %artifact, kind = ?kind, "Proof accepted");

        Ok(Submission {
            record,
            artifact,
            durable,
            mirror,
        })
    }

    /// Apply a review decision to the pending proof of `kind`.
    pub async fn review(
        &self,
        id: &str,
        kind: ProofKind,
        status: ProofStatus,
    ) -> AppResult<Written<()>> {
        let written = self
            .persistence
            .update(id, |p| p.resolve_pending(kind, status))
            .await?;
        info!(entity_id = id, kind = ?kind, status = ?status, step = %written.record.step, "Proof reviewed");
        Ok(written)
    }

    /// Run the verifier over the participant's most recent image on the
    /// CPU queue.
    pub async fn verify_latest_image(&self, id: &str) -> AppResult<Verdict> {
        let record = self
            .persistence
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Participant {id}")))?;
        let latest = record
            .images
            .last()
            .ok_or_else(|| AppError::NotFound(format!("No image proof for {id}")))?;
        let path: PathBuf = self.persistence.cache().artifact_path(&latest.artifact)?;

        let verifier = self.verifier.clone();
        let verdict = self
            .cpu
            .submit(move || {
                let bytes = std::fs::read(&path).map_err(|e| {
                    AppError::Cache(format!("Failed to read {}: {e}", path.display()))
                })?;
                verifier.verify(&bytes)
            })
            .await?;
        Ok(verdict)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::model::Step;
    use crate::testing::{FlakyBlobStore, MemoryStore, StaticSource};
    use proofbot_common::BlobStore;
    use proofbot_queue::{BLOB_QUEUE, DurableQueue, RELATIONAL_QUEUE, connection_gate};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        blobs: Arc<FlakyBlobStore>,
        service: ProofService,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let blobs = FlakyBlobStore::in_memory();
        let cache = Arc::new(LocalCache::open(dir.path()).await.unwrap());
        let persistence = Persistence::new(
            cache,
            store.clone(),
            blobs.clone(),
            DurableQueue::start(RELATIONAL_QUEUE, 1, connection_gate(1).unwrap()),
            DurableQueue::start(BLOB_QUEUE, 1, connection_gate(1).unwrap()),
        );
        let source = Arc::new(StaticSource::new(b"proof-bytes"));
        let service = ProofService::new(
            persistence,
            source,
            Arc::new(DigestVerifier),
            CpuQueue::start(1).unwrap(),
        );
        Fixture {
            _dir: dir,
            store,
            blobs,
            service,
        }
    }

    #[test]
    fn test_digest_verifier() {
        let verdict = DigestVerifier.verify(b"abc").unwrap();
        assert_eq!(
            verdict.fingerprint,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(verdict.size, 3);
        assert!(DigestVerifier.verify(b"").is_err());
    }

    #[tokio::test]
    async fn test_submit_image_persists_and_mirrors() {
        let f = fixture().await;
        f.service
            .persistence
            .update("42", |p| p.set_game_name("Ninja"))
            .await
            .unwrap();

        let submission = f
            .service
            .submit("42", ProofKind::Image, "https://cdn.example/a.png")
            .await
            .unwrap();
        assert_eq!(submission.artifact, "42_1.png");
        assert_eq!(submission.record.step, Step::Wait);

        submission.durable.await.unwrap();
        submission.mirror.await.unwrap();
        assert_eq!(f.store.get("42").unwrap().images.len(), 1);
        assert!(f.blobs.exists("42_1.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_at_wrong_step_fetches_nothing() {
        let f = fixture().await;
        let err = f
            .service
            .submit("42", ProofKind::Image, "https://cdn.example/a.png")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(!f.service.persistence.cache().has_artifact("42_1.png").await);
    }

    #[tokio::test]
    async fn test_review_then_verify() {
        let f = fixture().await;
        f.service
            .persistence
            .update("42", |p| p.set_game_name("Ninja"))
            .await
            .unwrap();
        f.service
            .submit("42", ProofKind::Image, "https://cdn.example/a.png")
            .await
            .unwrap();

        let verdict = f.service.verify_latest_image("42").await.unwrap();
        assert_eq!(verdict.size, 11);

        let written = f
            .service
            .review("42", ProofKind::Image, ProofStatus::Approved)
            .await
            .unwrap();
        assert_eq!(written.record.step, Step::VideoProof);
    }
}
