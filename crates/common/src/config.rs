//! Application configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Local cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Queue sizing.
    #[serde(default)]
    pub queues: QueueConfig,
    /// Chat platform API configuration.
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Startup recovery configuration.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Local cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding `records/` and `artifacts/`.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

/// Which blob backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// A directory on the local filesystem.
    Local,
    /// S3-compatible object storage.
    S3,
}

/// Blob storage settings as read from configuration files.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Selected backend.
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,
    /// Base path for the local backend.
    #[serde(default = "default_blob_path")]
    pub local_path: PathBuf,
    /// S3 endpoint URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// S3 bucket name.
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 region.
    #[serde(default)]
    pub region: Option<String>,
    /// S3 access key id.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// S3 secret access key.
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Key prefix within the bucket.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local_path: default_blob_path(),
            endpoint: None,
            bucket: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            prefix: None,
        }
    }
}

/// Queue sizing.
///
/// The `*_connections` values are the concurrency gates placed in front of
/// the relational pool and the blob client; they are independent of the
/// worker counts.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum dispatches to the platform API in any one-second window.
    #[serde(default = "default_dispatch_per_second")]
    pub dispatch_per_second: u32,
    /// Threads running CPU-bound analysis.
    #[serde(default = "default_cpu_workers")]
    pub cpu_workers: usize,
    /// Relational write workers.
    #[serde(default = "default_workers")]
    pub relational_workers: usize,
    /// Concurrently executing relational writes.
    #[serde(default = "default_connections")]
    pub relational_connections: usize,
    /// Blob upload workers.
    #[serde(default = "default_workers")]
    pub blob_workers: usize,
    /// Concurrent blob transfers (uploads and recovery downloads).
    #[serde(default = "default_connections")]
    pub blob_connections: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dispatch_per_second: default_dispatch_per_second(),
            cpu_workers: default_cpu_workers(),
            relational_workers: default_workers(),
            relational_connections: default_connections(),
            blob_workers: default_workers(),
            blob_connections: default_connections(),
        }
    }
}

/// Chat platform API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// REST API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bot token. The gateway is disabled when absent.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
        }
    }
}

/// Startup recovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Skip recovery and admit work immediately.
    #[serde(default)]
    pub skip: bool,
    /// Rows fetched per scan page.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            skip: false,
            page_size: default_page_size(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    5001
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data")
}

const fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Local
}

fn default_blob_path() -> PathBuf {
    PathBuf::from("./blobs")
}

const fn default_dispatch_per_second() -> u32 {
    50
}

const fn default_cpu_workers() -> usize {
    2
}

const fn default_workers() -> usize {
    2
}

const fn default_connections() -> usize {
    1
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

const fn default_page_size() -> u64 {
    500
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `PROOFBOT_ENV`)
    /// 4. Environment variables with `PROOFBOT__` prefix
    pub fn load() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("PROOFBOT_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("PROOFBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PROOFBOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the queue sizing against the database pool.
    pub fn validate(&self) -> AppResult<()> {
        let q = &self.queues;
        if q.dispatch_per_second == 0 {
            return Err(AppError::Config(
                "queues.dispatch_per_second must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("queues.cpu_workers", q.cpu_workers),
            ("queues.relational_workers", q.relational_workers),
            ("queues.relational_connections", q.relational_connections),
            ("queues.blob_workers", q.blob_workers),
            ("queues.blob_connections", q.blob_connections),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be at least 1")));
            }
        }
        if q.relational_connections as u64 > u64::from(self.database.max_connections) {
            return Err(AppError::Config(format!(
                "queues.relational_connections ({}) exceeds database.max_connections ({})",
                q.relational_connections, self.database.max_connections
            )));
        }
        if q.relational_connections > q.relational_workers {
            tracing::warn!(
                gate = q.relational_connections,
                workers = q.relational_workers,
                "Relational connection gate is larger than the worker pool and will never fill"
            );
        }
        if self.recovery.page_size == 0 {
            return Err(AppError::Config(
                "recovery.page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let file = write_config(
            r#"
            [database]
            url = "postgres://localhost/proofbot"
            "#,
        );
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.server.port, 5001);
        assert_eq!(config.queues.dispatch_per_second, 50);
        assert_eq!(config.queues.blob_connections, 1);
        assert_eq!(config.storage.backend, StorageBackendKind::Local);
        assert!(!config.recovery.skip);
        assert!(config.platform.token.is_none());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let file = write_config(
            r#"
            [database]
            url = "postgres://localhost/proofbot"

            [queues]
            cpu_workers = 0
            "#,
        );
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("cpu_workers")));
    }

    #[test]
    fn test_connection_gate_bounded_by_pool() {
        let file = write_config(
            r#"
            [database]
            url = "postgres://localhost/proofbot"
            max_connections = 2

            [queues]
            relational_workers = 8
            relational_connections = 4
            "#,
        );
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("max_connections")));
    }
}
