//! Participant entity, the durable mirror of a cached participant record.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One tracked participant.
///
/// Proof lists and the invite sub-record are stored as JSON columns; the
/// row is always written as a whole.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "participant")]
pub struct Model {
    /// External platform identifier.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Display name on the chat platform.
    #[sea_orm(nullable)]
    pub display_name: Option<String>,

    /// Link to the participant's private thread.
    #[sea_orm(nullable)]
    pub dm_link: Option<String>,

    /// Verified in-game name.
    #[sea_orm(nullable)]
    pub game_name: Option<String>,

    /// When the in-game name was submitted.
    #[sea_orm(nullable)]
    pub game_name_at: Option<DateTimeWithTimeZone>,

    /// Image proofs.
    #[sea_orm(column_type = "JsonBinary")]
    pub images: Json,

    /// Video proofs.
    #[sea_orm(column_type = "JsonBinary")]
    pub videos: Json,

    /// Workflow step label.
    pub step_state: String,

    /// Accrued score.
    #[sea_orm(default_value = 0)]
    pub score: i64,

    /// Whether the participant reacted to the giveaway message.
    #[sea_orm(default_value = false)]
    pub reacted: bool,

    /// Invite sub-record.
    #[sea_orm(column_type = "JsonBinary")]
    pub invite: Json,

    /// Time of the in-memory snapshot this row was written from.
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
