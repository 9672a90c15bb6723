//! Core participant workflow for proofbot.
//!
//! Participant records live in a [`LocalCache`] on disk and are mirrored to
//! a durable relational store through the write queues. Proof artifacts are
//! mirrored to a blob store. On startup [`RecoveryCoordinator`] rebuilds the
//! cache from the durable copies before any work is admitted.

pub mod cache;
pub mod context;
pub mod model;
pub mod recovery;
pub mod services;
pub mod testing;

pub use cache::{EntityGuard, LocalCache};
pub use context::AppContext;
pub use model::{Invite, Participant, Proof, ProofKind, ProofStatus, Step};
pub use recovery::{
    RecoveryCoordinator, RecoveryProgress, RecoveryReport, RecoveryState, RepairHandle,
    RepairOutcome,
};
pub use services::*;
