use crate::types::PaymentResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeAction {
    EmailReceipt,
    Retry,
    ReturnToStart,
}

/// One of exactly two terminal screens for a confirmation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    #[serde(rename_all = "camelCase")]
    Success {
        transaction_id: String,
        campaign_title: Option<String>,
        actions: Vec<OutcomeAction>,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        error: String,
        campaign_title: Option<String>,
        actions: Vec<OutcomeAction>,
    },
}

impl Outcome {
    pub fn resolve(result: &PaymentResult) -> Self {
        match (result.success, &result.transaction_id) {
            (true, Some(transaction_id)) => Self::Success {
                transaction_id: transaction_id.clone(),
                campaign_title: result.campaign_title.clone(),
                actions: vec![OutcomeAction::EmailReceipt, OutcomeAction::ReturnToStart],
            },
            _ => Self::Failure {
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| crate::orchestrator::GENERIC_PAYMENT_ERROR.to_string()),
                campaign_title: result.campaign_title.clone(),
                actions: vec![OutcomeAction::Retry, OutcomeAction::ReturnToStart],
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn actions(&self) -> &[OutcomeAction] {
        match self {
            Self::Success { actions, .. } | Self::Failure { actions, .. } => actions,
        }
    }

    pub fn allows(&self, action: OutcomeAction) -> bool {
        self.actions().contains(&action)
    }
}
