//! Business services.

pub mod admin;
pub mod durable;
pub mod gateway;
pub mod persistence;
pub mod proofs;

pub use admin::{AdminService, ParticipantView, PurgeReport};
pub use durable::{DurableStore, SharedDurableStore, SqlDurableStore};
pub use gateway::{Channel, MessageRef, PlatformGateway, PlatformUser};
pub use persistence::{Persistence, Written};
pub use proofs::{
    ArtifactSource, DigestVerifier, HttpArtifactSource, ProofService, ProofVerifier, Submission,
    Verdict,
};
