//! Database layer for proofbot.
//!
//! The durable store holds one row per participant, keyed by the platform's
//! external identifier. Every write replaces the full row image.

pub mod entities;
pub mod migrations;
pub mod repositories;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use proofbot_common::{AppError, DatabaseConfig};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;
use tracing::log::LevelFilter;

/// Initialize database connection.
///
/// `max_connections` is the hard ceiling on concurrently open connections;
/// the relational write queue gates its workers below it.
pub async fn init(config: &DatabaseConfig) -> Result<DatabaseConnection, AppError> {
    let mut opt = ConnectOptions::new(&config.url);

    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(LevelFilter::Debug);

    Database::connect(opt)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}

/// Run pending migrations. Idempotent: tables are created only if absent.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), AppError> {
    use sea_orm_migration::MigratorTrait;
    migrations::Migrator::up(db, None)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}
