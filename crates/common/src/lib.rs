//! Common utilities and shared types for proofbot.
//!
//! This crate provides foundational components used across all proofbot crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Storage**: Blob store backends (local, S3-compatible) for proof artifacts
//!
//! # Example
//!
//! ```no_run
//! use proofbot_common::{AppResult, Config, build_blob_store};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let _blobs = build_blob_store(&config.storage)?;
//!     println!("Dispatch cap: {}/s", config.queues.dispatch_per_second);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod storage;

pub use config::{
    CacheConfig, Config, DatabaseConfig, PlatformConfig, QueueConfig, RecoveryConfig,
    ServerConfig, StorageBackendKind, StorageSettings,
};
pub use error::{AppError, AppResult};
pub use storage::{
    BlobStore, LocalBlobStore, SharedBlobStore, StoredBlob, build_blob_store, validate_key,
};

#[cfg(feature = "s3")]
pub use storage::S3BlobStore;
