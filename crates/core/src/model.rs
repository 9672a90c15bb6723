//! Participant record and its workflow rules.
//!
//! A participant moves through a linear workflow:
//! `game_name` → `image_proof` → `wait` → `video_proof` (→ `wait` → ...).
//! At most one proof is pending review at any time; a submission is only
//! accepted when the current step allows it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use proofbot_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Position in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Waiting for the in-game name.
    #[default]
    GameName,
    /// Waiting for an image proof.
    ImageProof,
    /// A proof is pending review.
    Wait,
    /// Waiting for a video proof.
    VideoProof,
}

impl Step {
    /// Stored label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GameName => "game_name",
            Self::ImageProof => "image_proof",
            Self::Wait => "wait",
            Self::VideoProof => "video_proof",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game_name" => Ok(Self::GameName),
            "image_proof" => Ok(Self::ImageProof),
            "wait" => Ok(Self::Wait),
            "video_proof" => Ok(Self::VideoProof),
            other => Err(AppError::Database(format!("Unknown step label: {other}"))),
        }
    }
}

/// Review status of a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    /// Waiting for a reviewer.
    Pending,
    /// Accepted.
    Approved,
    /// Rejected.
    Denied,
}

/// Kind of proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    /// Screenshot.
    Image,
    /// Gameplay recording.
    Video,
}

impl ProofKind {
    /// File extension of stored artifacts.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
        }
    }
}

/// A submitted proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Where the submission was fetched from.
    pub source_url: String,
    /// File name in the artifact directory; also the blob key.
    pub artifact: String,
    /// When the proof was received.
    pub uploaded_at: DateTime<Utc>,
    /// Review status.
    pub status: ProofStatus,
}

/// Invite bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    /// Invite code this participant joined with.
    #[serde(default)]
    pub used_code: Option<String>,
    /// Who created that invite.
    #[serde(default)]
    pub inviter_id: Option<String>,
    /// Members who joined through this participant's invites.
    #[serde(default)]
    pub invited: Vec<String>,
    /// Always `invited.len()`.
    #[serde(default)]
    pub total: u32,
}

/// One tracked participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// External platform identifier.
    pub id: String,
    /// Display name on the platform.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Link to the private support thread.
    #[serde(default)]
    pub dm_link: Option<String>,
    /// Verified in-game name.
    #[serde(default)]
    pub game_name: Option<String>,
    /// When the in-game name was set.
    #[serde(default)]
    pub game_name_at: Option<DateTime<Utc>>,
    /// Image proofs in submission order.
    #[serde(default)]
    pub images: Vec<Proof>,
    /// Video proofs in submission order.
    #[serde(default)]
    pub videos: Vec<Proof>,
    /// Workflow position.
    #[serde(default)]
    pub step: Step,
    /// Accrued score.
    #[serde(default)]
    pub score: i64,
    /// Reacted to the giveaway message.
    #[serde(default)]
    pub reacted: bool,
    /// Invite bookkeeping.
    #[serde(default)]
    pub invite: Invite,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Participant {
    /// A fresh record at the start of the workflow.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            dm_link: None,
            game_name: None,
            game_name_at: None,
            images: Vec::new(),
            videos: Vec::new(),
            step: Step::GameName,
            score: 0,
            reacted: false,
            invite: Invite::default(),
            updated_at: Utc::now(),
        }
    }

    fn proofs(&self, kind: ProofKind) -> &[Proof] {
        match kind {
            ProofKind::Image => &self.images,
            ProofKind::Video => &self.videos,
        }
    }

    fn proofs_mut(&mut self, kind: ProofKind) -> &mut Vec<Proof> {
        match kind {
            ProofKind::Image => &mut self.images,
            ProofKind::Video => &mut self.videos,
        }
    }

    /// The proof currently awaiting review, if any.
    #[must_use]
    pub fn pending(&self) -> Option<(ProofKind, &Proof)> {
        self.images
            .iter()
            .map(|p| (ProofKind::Image, p))
            .chain(self.videos.iter().map(|p| (ProofKind::Video, p)))
            .find(|(_, p)| p.status == ProofStatus::Pending)
    }

    /// Every pending proof. Holds at most one entry for records written
    /// through the workflow; restored rows are not re-validated.
    pub fn pending_proofs(&self) -> impl Iterator<Item = &Proof> {
        self.images
            .iter()
            .chain(self.videos.iter())
            .filter(|p| p.status == ProofStatus::Pending)
    }

    /// Artifact file name the next proof of `kind` will be stored under.
    #[must_use]
    pub fn next_artifact_name(&self, kind: ProofKind) -> String {
        format!(
            "{}_{}.{}",
            self.id,
            self.proofs(kind).len() + 1,
            kind.extension()
        )
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record the display name.
    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = Some(name.into());
        self.touch();
    }

    /// Record the support thread link.
    pub fn set_dm_link(&mut self, link: impl Into<String>) {
        self.dm_link = Some(link.into());
        self.touch();
    }

    /// Set the in-game name. Allowed once.
    pub fn set_game_name(&mut self, name: impl Into<String>) -> AppResult<()> {
        if let Some(existing) = &self.game_name {
            return Err(AppError::Conflict(format!(
                "Participant {} already verified game name {existing}",
                self.id
            )));
        }

        self.game_name = Some(name.into());
        self.game_name_at = Some(Utc::now());
        if self.step == Step::GameName {
            self.step = Step::ImageProof;
        }
        self.touch();
        Ok(())
    }

    /// Append a pending proof of `kind`. Returns the artifact name.
    pub fn attach(&mut self, kind: ProofKind, source_url: impl Into<String>) -> AppResult<String> {
        let allowed = match kind {
            ProofKind::Image => self.step == Step::ImageProof,
            ProofKind::Video => matches!(self.step, Step::ImageProof | Step::VideoProof),
        };
        if !allowed {
            return Err(AppError::Conflict(format!(
                "Participant {} cannot submit a {kind:?} proof at step {}",
                self.id, self.step
            )));
        }
        if self.pending().is_some() {
            return Err(AppError::Conflict(format!(
                "Participant {} already has a proof pending review",
                self.id
            )));
        }

        let artifact = self.next_artifact_name(kind);
        self.proofs_mut(kind).push(Proof {
            source_url: source_url.into(),
            artifact: artifact.clone(),
            uploaded_at: Utc::now(),
            status: ProofStatus::Pending,
        });
        self.step = Step::Wait;
        self.touch();
        Ok(artifact)
    }

    /// Append a pending image proof.
    pub fn attach_image(&mut self, source_url: impl Into<String>) -> AppResult<String> {
        self.attach(ProofKind::Image, source_url)
    }

    /// Append a pending video proof.
    pub fn attach_video(&mut self, source_url: impl Into<String>) -> AppResult<String> {
        self.attach(ProofKind::Video, source_url)
    }

    /// Settle the pending proof of `kind` and move the workflow on.
    pub fn resolve_pending(&mut self, kind: ProofKind, status: ProofStatus) -> AppResult<()> {
        if status == ProofStatus::Pending {
            return Err(AppError::Conflict(
                "A review decision must approve or deny".to_string(),
            ));
        }
        let id = self.id.clone();
        let proof = self
            .proofs_mut(kind)
            .iter_mut()
            .find(|p| p.status == ProofStatus::Pending)
            .ok_or_else(|| AppError::NotFound(format!("No pending {kind:?} proof for {id}")))?;
        proof.status = status;

        self.step = match (kind, status) {
            (ProofKind::Image, ProofStatus::Denied) => Step::ImageProof,
            _ => Step::VideoProof,
        };
        self.touch();
        Ok(())
    }

    /// Record the reaction. Returns false when it was already recorded.
    pub fn mark_reacted(&mut self) -> bool {
        if self.reacted {
            return false;
        }
        self.reacted = true;
        self.touch();
        true
    }

    /// Add a member who joined through this participant's invite.
    pub fn record_invited(&mut self, member_id: &str) {
        if !self.invite.invited.iter().any(|m| m == member_id) {
            self.invite.invited.push(member_id.to_string());
        }
        self.invite.total = self.invite.invited.len() as u32;
        self.touch();
    }

    /// Remove a member that left. Returns whether it was tracked.
    pub fn remove_invited(&mut self, member_id: &str) -> bool {
        let before = self.invite.invited.len();
        self.invite.invited.retain(|m| m != member_id);
        self.invite.total = self.invite.invited.len() as u32;
        self.touch();
        before != self.invite.invited.len()
    }

    /// Record which invite this participant joined with.
    pub fn set_invited_by(&mut self, code: impl Into<String>, inviter_id: impl Into<String>) {
        self.invite.used_code = Some(code.into());
        self.invite.inviter_id = Some(inviter_id.into());
        self.touch();
    }

    /// Add `delta` to the score.
    pub fn add_score(&mut self, delta: i64) {
        self.score = self.score.saturating_add(delta);
        self.touch();
    }
}
