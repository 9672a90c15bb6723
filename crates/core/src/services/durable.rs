//! Durable relational store.
//!
//! The relational table is the source of truth across restarts. Code in
//! this crate talks to it through [`DurableStore`] so recovery and the
//! write path can run against an in-memory store in tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use proofbot_common::{AppError, AppResult};
use proofbot_db::entities::participant;
use proofbot_db::repositories::ParticipantRepository;
use sea_orm::DatabaseConnection;

use crate::model::{Invite, Participant, Proof};

/// Operations the core needs from the relational store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Create the table if absent. Idempotent.
    async fn ensure_schema(&self) -> AppResult<()>;

    /// Up to `limit` records with id greater than `after`, ordered by id.
    async fn fetch_page(&self, after: Option<&str>, limit: u64) -> AppResult<Vec<Participant>>;

    /// Insert or fully replace the row for `record.id`.
    async fn upsert(&self, record: &Participant) -> AppResult<()>;

    /// Point lookup.
    async fn find(&self, id: &str) -> AppResult<Option<Participant>>;

    /// Delete every row. Returns the number removed.
    async fn truncate(&self) -> AppResult<u64>;
}

/// Shared handle to a durable store.
pub type SharedDurableStore = Arc<dyn DurableStore>;

/// [`DurableStore`] over `PostgreSQL` via sea-orm.
#[derive(Clone)]
pub struct SqlDurableStore {
    repo: ParticipantRepository,
}

impl SqlDurableStore {
    /// Wrap a connection.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            repo: ParticipantRepository::new(db),
        }
    }
}

#[async_trait]
impl DurableStore for SqlDurableStore {
    async fn ensure_schema(&self) -> AppResult<()> {
        proofbot_db::migrate(self.repo.connection()).await
    }

    async fn fetch_page(&self, after: Option<&str>, limit: u64) -> AppResult<Vec<Participant>> {
        self.repo
            .find_page(after, limit)
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    async fn upsert(&self, record: &Participant) -> AppResult<()> {
        self.repo.upsert(to_row(record)?).await
    }

    async fn find(&self, id: &str) -> AppResult<Option<Participant>> {
        self.repo.find_by_id(id).await?.map(from_row).transpose()
    }

    async fn truncate(&self) -> AppResult<u64> {
        self.repo.truncate().await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> AppResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AppError::Database(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(
    id: &str,
    column: &str,
    value: serde_json::Value,
) -> AppResult<T> {
    // Rows written before a column was populated hold SQL-side defaults.
    let value = if value.is_null() {
        serde_json::Value::Array(Vec::new())
    } else {
        value
    };
    serde_json::from_value(value)
        .map_err(|e| AppError::Database(format!("Malformed {column} for {id}: {e}")))
}

/// Full row image of a record.
pub fn to_row(record: &Participant) -> AppResult<participant::Model> {
    Ok(participant::Model {
        id: record.id.clone(),
        display_name: record.display_name.clone(),
        dm_link: record.dm_link.clone(),
        game_name: record.game_name.clone(),
        game_name_at: record.game_name_at.map(Into::into),
        images: encode(&record.images)?,
        videos: encode(&record.videos)?,
        step_state: record.step.as_str().to_string(),
        score: record.score,
        reacted: record.reacted,
        invite: encode(&record.invite)?,
        updated_at: record.updated_at.into(),
    })
}

/// Rebuild a record from its row.
pub fn from_row(row: participant::Model) -> AppResult<Participant> {
    let images: Vec<Proof> = decode(&row.id, "images", row.images)?;
    let videos: Vec<Proof> = decode(&row.id, "videos", row.videos)?;
    let invite: Invite = if row.invite.is_null() {
        Invite::default()
    } else {
        serde_json::from_value(row.invite)
            .map_err(|e| AppError::Database(format!("Malformed invite for {}: {e}", row.id)))?
    };

    Ok(Participant {
        step: row.step_state.parse()?,
        display_name: row.display_name,
        dm_link: row.dm_link,
        game_name: row.game_name,
        game_name_at: row.game_name_at.map(|at| at.with_timezone(&Utc)),
        images,
        videos,
        score: row.score,
        reacted: row.reacted,
        invite,
        updated_at: row.updated_at.with_timezone(&Utc),
        id: row.id,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ProofKind, Step};
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn sample() -> Participant {
        let mut p = Participant::new("1001");
        p.set_display_name("alice");
        p.set_game_name("AliceFN").unwrap();
        p.attach(ProofKind::Image, "https://cdn/a.png").unwrap();
        p.set_invited_by("code1", "999");
        p.record_invited("1002");
        p
    }

    #[test]
    fn test_row_mapping_preserves_record() {
        let record = sample();
        let row = to_row(&record).unwrap();
        assert_eq!(row.step_state, "wait");
        assert!(row.images.is_array());

        let back = from_row(row).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let mut row = to_row(&sample()).unwrap();
        row.step_state = "finished".to_string();
        assert!(matches!(from_row(row), Err(AppError::Database(_))));
    }

    #[test]
    fn test_null_lists_read_as_empty() {
        let mut row = to_row(&Participant::new("5")).unwrap();
        row.images = serde_json::Value::Null;
        row.invite = serde_json::Value::Null;
        let record = from_row(row).unwrap();
        assert!(record.images.is_empty());
        assert_eq!(record.step, Step::GameName);
    }

    #[tokio::test]
    async fn test_sql_store_find_and_upsert() {
        let record = sample();
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[to_row(&record).unwrap()]])
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .into_connection(),
        );

        let store = SqlDurableStore::new(db);
        let found = store.find("1001").await.unwrap().unwrap();
        assert_eq!(found.game_name.as_deref(), Some("AliceFN"));

        store.upsert(&found).await.unwrap();
    }
}
