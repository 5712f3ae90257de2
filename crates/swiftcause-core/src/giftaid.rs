use crate::error::SwiftCauseError;
use crate::outbox::{Outbox, OutboxTask};
use crate::store::DonationStore;
use crate::types::{DonationDraft, GiftAidDeclaration, PaymentResult, PaymentStatus};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Declaration for a settled payment, or `None` when the payment failed or the
/// donor did not opt in.
pub fn build_declaration(
    draft: &DonationDraft,
    result: &PaymentResult,
    campaign_title: &str,
) -> Option<GiftAidDeclaration> {
    if !result.success {
        return None;
    }
    let transaction_id = result.transaction_id.clone()?;
    let donor = draft.gift_aid()?.clone();

    Some(GiftAidDeclaration {
        id: Uuid::new_v4().to_string(),
        donor,
        donation_amount: draft.amount(),
        gift_aid_amount: GiftAidDeclaration::reclaim_value(draft.amount()),
        currency: draft.currency().to_string(),
        campaign_id: draft.campaign_id().to_string(),
        campaign_title: campaign_title.to_string(),
        transaction_id,
        submitted_at: Utc::now(),
    })
}

/// Hands Gift Aid declarations to the outbox after a successful payment.
#[derive(Clone)]
pub struct GiftAidRecorder {
    outbox: Arc<Outbox>,
}

impl GiftAidRecorder {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }

    /// Never fails: the payment already settled, so enqueue errors are only logged.
    pub async fn record_after_payment(
        &self,
        draft: &DonationDraft,
        result: &PaymentResult,
        campaign_title: &str,
    ) -> Option<String> {
        let declaration = build_declaration(draft, result, campaign_title)?;
        let transaction_id = declaration.transaction_id.clone();
        match self
            .outbox
            .enqueue(OutboxTask::RecordGiftAid { declaration })
            .await
        {
            Ok(entry_id) => Some(entry_id),
            Err(err) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    campaign_id = draft.campaign_id(),
                    error = %err,
                    "failed to enqueue gift aid declaration"
                );
                None
            }
        }
    }
}

/// Write a declaration, provided the donation it refers to is stored and successful.
pub async fn persist_declaration(
    store: &dyn DonationStore,
    declaration: &GiftAidDeclaration,
) -> Result<(), SwiftCauseError> {
    let donation = store
        .find_donation_by_transaction(&declaration.transaction_id)
        .await?
        .ok_or_else(|| {
            SwiftCauseError::InvariantViolation(format!(
                "no donation recorded for transaction '{}'",
                declaration.transaction_id
            ))
        })?;
    if donation.payment_status != PaymentStatus::Success {
        return Err(SwiftCauseError::InvariantViolation(format!(
            "donation '{}' is not successful",
            donation.id
        )));
    }

    if store.insert_gift_aid(declaration).await? {
        tracing::info!(
            transaction_id = %declaration.transaction_id,
            donation_id = %donation.id,
            gift_aid_amount = declaration.gift_aid_amount,
            "gift aid declaration recorded"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::{sample_gift_aid, DonationDraftBuilder};
    use crate::outbox::RetryPolicy;
    use crate::store::InMemoryStore;
    use crate::types::Donation;

    fn gift_aid_draft() -> DonationDraft {
        DonationDraftBuilder::new("camp-1", "gbp")
            .amount_minor(2_000)
            .gift_aid(sample_gift_aid())
            .build()
            .unwrap()
    }

    #[test]
    fn declaration_only_for_successful_gift_aid_payments() {
        let draft = gift_aid_draft();
        let failed = PaymentResult::failed("declined", None);
        assert!(build_declaration(&draft, &failed, "Title").is_none());

        let plain = DonationDraftBuilder::new("camp-1", "gbp")
            .amount_minor(2_000)
            .build()
            .unwrap();
        let ok = PaymentResult::succeeded("pi_1", None);
        assert!(build_declaration(&plain, &ok, "Title").is_none());

        let declaration = build_declaration(&draft, &ok, "Title").unwrap();
        assert_eq!(declaration.gift_aid_amount, 500);
        assert_eq!(declaration.transaction_id, "pi_1");
        assert_eq!(declaration.donor.full_name(), "Ada Lovelace");
    }

    #[tokio::test]
    async fn declaration_requires_stored_donation() {
        let store = InMemoryStore::new();
        let draft = gift_aid_draft();
        let result = PaymentResult::succeeded("pi_7", None);
        let declaration = build_declaration(&draft, &result, "Title").unwrap();

        assert!(matches!(
            persist_declaration(&store, &declaration).await,
            Err(SwiftCauseError::InvariantViolation(_))
        ));
        assert!(store.list_gift_aid().await.unwrap().is_empty());

        store
            .record_donation(&Donation::from_draft(&draft, "pi_7"))
            .await
            .unwrap();
        persist_declaration(&store, &declaration).await.unwrap();
        persist_declaration(&store, &declaration).await.unwrap();
        assert_eq!(store.list_gift_aid().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recorder_enqueues_into_outbox() {
        let outbox = Arc::new(Outbox::in_memory(RetryPolicy::default()));
        let recorder = GiftAidRecorder::new(outbox.clone());
        let entry = recorder
            .record_after_payment(
                &gift_aid_draft(),
                &PaymentResult::succeeded("pi_8", None),
                "Title",
            )
            .await;
        assert!(entry.is_some());
        assert_eq!(outbox.pending_count().await, 1);
    }
}
