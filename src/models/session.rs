use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::Slot;

/// Pipeline position of a booking conversation. Advancement is monotonic
/// except for an explicit reset back to `Verification`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Verification,
    Availability,
    Commit,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Verification => "verification",
            PipelineStage::Availability => "availability",
            PipelineStage::Commit => "commit",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "availability" => PipelineStage::Availability,
            "commit" => PipelineStage::Commit,
            "done" => PipelineStage::Done,
            "failed" => PipelineStage::Failed,
            _ => PipelineStage::Verification,
        }
    }

    /// Terminal for the current booking attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProof {
    pub credential_fragment: String,
    pub phone: String,
}

/// Per-conversation booking state, owned by the pipeline for the lifetime of
/// the conversation and never shared across conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingSession {
    pub conversation_id: String,
    pub stage: PipelineStage,
    pub verification: VerificationStatus,
    pub identity: Option<IdentityProof>,
    pub candidate_slots: Vec<Slot>,
    pub selected_slot: Option<Slot>,
    pub appointment_ref: Option<String>,
    pub last_activity: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

impl BookingSession {
    pub fn new(conversation_id: &str) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            conversation_id: conversation_id.to_string(),
            stage: PipelineStage::Verification,
            verification: VerificationStatus::Unverified,
            identity: None,
            candidate_slots: Vec::new(),
            selected_slot: None,
            appointment_ref: None,
            last_activity: now,
            expires_at: now + chrono::Duration::minutes(30),
        }
    }

    /// Start a fresh booking attempt in the same conversation.
    pub fn reset(&mut self) {
        self.stage = PipelineStage::Verification;
        self.verification = VerificationStatus::Unverified;
        self.identity = None;
        self.candidate_slots.clear();
        self.selected_slot = None;
        self.appointment_ref = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for stage in [
            PipelineStage::Verification,
            PipelineStage::Availability,
            PipelineStage::Commit,
            PipelineStage::Done,
            PipelineStage::Failed,
        ] {
            assert_eq!(PipelineStage::parse(stage.as_str()), stage);
        }
    }

    #[test]
    fn test_unknown_stage_defaults_to_verification() {
        assert_eq!(PipelineStage::parse("garbage"), PipelineStage::Verification);
    }

    #[test]
    fn test_reset_clears_booking_state() {
        let mut session = BookingSession::new("conv-1");
        session.stage = PipelineStage::Done;
        session.verification = VerificationStatus::Verified;
        session.appointment_ref = Some("APT-12AB34CD".to_string());

        session.reset();

        assert_eq!(session.stage, PipelineStage::Verification);
        assert_eq!(session.verification, VerificationStatus::Unverified);
        assert!(session.appointment_ref.is_none());
        assert!(session.candidate_slots.is_empty());
    }
}
