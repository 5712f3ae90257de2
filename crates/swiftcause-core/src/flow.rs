use crate::error::SwiftCauseError;
use serde::{Deserialize, Serialize};

/// Lifecycle stages of a single donation draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStage {
    Drafting,
    Confirming,
    Succeeded,
    Failed,
}

impl DonationStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Drafting => "drafting",
            Self::Confirming => "confirming",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Enforces drafting -> confirming -> succeeded|failed, with failed -> confirming on retry.
///
/// Transitions are explicit methods so a caller cannot record a success for a
/// draft that was never submitted.
#[derive(Debug, Clone)]
pub struct DonationFlow {
    draft_id: String,
    stage: DonationStage,
    attempts: u32,
}

impl DonationFlow {
    pub fn new(draft_id: impl Into<String>) -> Self {
        Self {
            draft_id: draft_id.into(),
            stage: DonationStage::Drafting,
            attempts: 0,
        }
    }

    pub fn draft_id(&self) -> &str {
        &self.draft_id
    }

    pub fn stage(&self) -> DonationStage {
        self.stage
    }

    /// Number of confirmation attempts started for this draft.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, DonationStage::Succeeded | DonationStage::Failed)
    }

    pub fn submit(&mut self) -> Result<(), SwiftCauseError> {
        self.advance(DonationStage::Drafting, DonationStage::Confirming)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn mark_succeeded(&mut self) -> Result<(), SwiftCauseError> {
        self.advance(DonationStage::Confirming, DonationStage::Succeeded)
    }

    pub fn mark_failed(&mut self) -> Result<(), SwiftCauseError> {
        self.advance(DonationStage::Confirming, DonationStage::Failed)
    }

    pub fn retry(&mut self) -> Result<(), SwiftCauseError> {
        self.advance(DonationStage::Failed, DonationStage::Confirming)?;
        self.attempts += 1;
        Ok(())
    }

    fn advance(
        &mut self,
        expected_current: DonationStage,
        next: DonationStage,
    ) -> Result<(), SwiftCauseError> {
        if self.stage != expected_current {
            return Err(SwiftCauseError::stage_violation(
                expected_current.name(),
                self.stage.name(),
            ));
        }
        self.stage = next;
        Ok(())
    }
}
