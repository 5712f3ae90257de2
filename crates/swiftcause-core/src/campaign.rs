use crate::error::SwiftCauseError;
use crate::store::DonationStore;
use crate::types::Campaign;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Campaign as shown to a donor: goal, raised amount, and progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSummary {
    pub id: String,
    pub title: String,
    pub currency: String,
    pub goal_amount: u64,
    pub collected_amount: u64,
    pub donation_count: u64,
    pub progress_percent: f64,
    pub is_active: bool,
}

impl From<&Campaign> for CampaignSummary {
    fn from(campaign: &Campaign) -> Self {
        Self {
            id: campaign.id.clone(),
            title: campaign.title.clone(),
            currency: campaign.currency.clone(),
            goal_amount: campaign.goal_amount,
            collected_amount: campaign.collected_amount,
            donation_count: campaign.donation_count,
            progress_percent: progress_percent(campaign.collected_amount, campaign.goal_amount),
            is_active: campaign.is_active,
        }
    }
}

/// Progress toward the goal, capped at 100. A zero goal reads as 0%.
pub fn progress_percent(collected: u64, goal: u64) -> f64 {
    if goal == 0 {
        return 0.0;
    }
    let percent = (collected as f64 / goal as f64) * 100.0;
    (percent * 10.0).round().min(1000.0) / 10.0
}

#[derive(Clone)]
pub struct CampaignLookup {
    store: Arc<dyn DonationStore>,
}

impl CampaignLookup {
    pub fn new(store: Arc<dyn DonationStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, campaign_id: &str) -> Result<Campaign, SwiftCauseError> {
        self.store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| SwiftCauseError::not_found(format!("campaign '{}'", campaign_id)))
    }

    /// Resolve a campaign that may receive a new donation.
    pub async fn open_for_donations(&self, campaign_id: &str) -> Result<Campaign, SwiftCauseError> {
        let campaign = self.get(campaign_id).await?;
        if !campaign.is_active {
            return Err(SwiftCauseError::validation(format!(
                "campaign '{}' is not accepting donations",
                campaign_id
            )));
        }
        Ok(campaign)
    }

    pub async fn summary(&self, campaign_id: &str) -> Result<CampaignSummary, SwiftCauseError> {
        Ok(CampaignSummary::from(&self.get(campaign_id).await?))
    }

    /// Title for receipts and declarations; lookup failures are not fatal there.
    pub async fn title_or(&self, campaign_id: &str, fallback: &str) -> String {
        match self.store.get_campaign(campaign_id).await {
            Ok(Some(campaign)) => campaign.title,
            Ok(None) => fallback.to_string(),
            Err(err) => {
                tracing::warn!(campaign_id, error = %err, "campaign title lookup failed");
                fallback.to_string()
            }
        }
    }
}
