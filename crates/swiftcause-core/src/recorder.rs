use crate::error::SwiftCauseError;
use crate::events::{DonationEvent, EventBus};
use crate::store::{DonationStore, RecordOutcome};
use crate::types::Donation;
use std::sync::Arc;

/// Single write path for donations. Every committed write is published on the bus.
#[derive(Clone)]
pub struct DonationRecorder {
    store: Arc<dyn DonationStore>,
    events: EventBus,
}

impl DonationRecorder {
    pub fn new(store: Arc<dyn DonationStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn DonationStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Persist a successful donation. Replays of the same transaction return the
    /// stored record and publish nothing.
    pub async fn record(&self, donation: Donation) -> Result<RecordOutcome, SwiftCauseError> {
        let outcome = self.store.record_donation(&donation).await?;
        match &outcome {
            RecordOutcome::Inserted(stored) => {
                tracing::info!(
                    donation_id = %stored.id,
                    transaction_id = %stored.transaction_id,
                    campaign_id = %stored.campaign_id,
                    amount = stored.amount,
                    currency = %stored.currency,
                    recurring = stored.is_recurring,
                    "donation recorded"
                );
                self.events.publish(DonationEvent::Created(stored.clone()));
            }
            RecordOutcome::Duplicate(stored) => {
                tracing::debug!(
                    donation_id = %stored.id,
                    transaction_id = %stored.transaction_id,
                    "donation already recorded for transaction"
                );
            }
        }
        Ok(outcome)
    }

    pub async fn attach_donor_email(
        &self,
        donation_id: &str,
        email: &str,
    ) -> Result<Donation, SwiftCauseError> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(SwiftCauseError::validation(format!(
                "'{}' is not an email address",
                email
            )));
        }
        let (before, after) = self.store.attach_donor_email(donation_id, email).await?;
        tracing::info!(donation_id, "donor email attached");
        self.events.publish(DonationEvent::Updated {
            before,
            after: after.clone(),
        });
        Ok(after)
    }
}
