//! Repositories over the database entities.

mod participant;

pub use participant::ParticipantRepository;
