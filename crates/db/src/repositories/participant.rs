//! Participant repository.

use std::sync::Arc;

use proofbot_common::{AppError, AppResult};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, Order,
    QueryFilter, QueryOrder, QuerySelect, sea_query::OnConflict,
};

use crate::entities::{Participant, participant};

/// Repository for participant rows.
#[derive(Clone)]
pub struct ParticipantRepository {
    db: Arc<DatabaseConnection>,
}

impl ParticipantRepository {
    /// Create a new participant repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// Find participant by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<participant::Model>> {
        Participant::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Fetch up to `limit` rows with an id strictly greater than `after`,
    /// ordered by id.
    ///
    /// Keyset pagination keeps every page a single index range scan no
    /// matter how deep the scan has progressed.
    pub async fn find_page(
        &self,
        after: Option<&str>,
        limit: u64,
    ) -> AppResult<Vec<participant::Model>> {
        let mut query = Participant::find();

        if let Some(after) = after {
            query = query.filter(participant::Column::Id.gt(after));
        }

        query
            .order_by(participant::Column::Id, Order::Asc)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Insert the row or replace every column of the existing one.
    pub async fn upsert(&self, model: participant::Model) -> AppResult<()> {
        let active = participant::ActiveModel {
            id: Set(model.id),
            display_name: Set(model.display_name),
            dm_link: Set(model.dm_link),
            game_name: Set(model.game_name),
            game_name_at: Set(model.game_name_at),
            images: Set(model.images),
            videos: Set(model.videos),
            step_state: Set(model.step_state),
            score: Set(model.score),
            reacted: Set(model.reacted),
            invite: Set(model.invite),
            updated_at: Set(model.updated_at),
        };

        Participant::insert(active)
            .on_conflict(
                OnConflict::column(participant::Column::Id)
                    .update_columns([
                        participant::Column::DisplayName,
                        participant::Column::DmLink,
                        participant::Column::GameName,
                        participant::Column::GameNameAt,
                        participant::Column::Images,
                        participant::Column::Videos,
                        participant::Column::StepState,
                        participant::Column::Score,
                        participant::Column::Reacted,
                        participant::Column::Invite,
                        participant::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    /// Delete every participant row. Returns the number removed.
    pub async fn truncate(&self) -> AppResult<u64> {
        let result = Participant::delete_many()
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};
    use serde_json::json;

    fn create_test_participant(id: &str, score: i64) -> participant::Model {
        participant::Model {
            id: id.to_string(),
            display_name: Some(format!("user-{id}")),
            dm_link: None,
            game_name: None,
            game_name_at: None,
            images: json!([]),
            videos: json!([]),
            step_state: "game_name".to_string(),
            score,
            reacted: false,
            invite: json!({}),
            updated_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_find_by_id_returns_participant() {
        let row = create_test_participant("111", 4);

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[row.clone()]])
                .into_connection(),
        );

        let repo = ParticipantRepository::new(db);
        let found = repo.find_by_id("111").await.unwrap().unwrap();

        assert_eq!(found.id, "111");
        assert_eq!(found.score, 4);
    }

    #[tokio::test]
    async fn test_find_by_id_not_found() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<participant::Model>::new()])
                .into_connection(),
        );

        let repo = ParticipantRepository::new(db);
        assert!(repo.find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_page_filters_after_cursor() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[
                    create_test_participant("200", 0),
                    create_test_participant("300", 0),
                ]])
                .into_connection(),
        );

        let repo = ParticipantRepository::new(db.clone());
        let page = repo.find_page(Some("100"), 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "200");
        drop(repo);

        let log = Arc::try_unwrap(db).unwrap().into_transaction_log();
        let sql = format!("{log:?}");
        assert!(sql.contains("> $1"));
        assert!(sql.contains("ORDER BY"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_on_conflict() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                }])
                .into_connection(),
        );

        let repo = ParticipantRepository::new(db.clone());
        repo.upsert(create_test_participant("111", 7)).await.unwrap();
        drop(repo);

        let log = Arc::try_unwrap(db).unwrap().into_transaction_log();
        let sql = format!("{log:?}");
        assert!(sql.contains("ON CONFLICT"));
        assert!(sql.contains("DO UPDATE SET"));
    }

    #[tokio::test]
    async fn test_truncate_reports_rows_removed() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 3,
                }])
                .into_connection(),
        );

        let repo = ParticipantRepository::new(db);
        assert_eq!(repo.truncate().await.unwrap(), 3);
    }
}
