//! Database entities.

pub mod participant;

pub use participant::Entity as Participant;
