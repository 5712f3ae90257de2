use crate::gateway::{
    payment_intent_id_from_client_secret, CreatePaymentIntentRequest, IntentBackend,
    PaymentConfirmer, PaymentMethodInput,
};
use crate::types::{Campaign, DonationDraft, PaymentResult};
use std::sync::Arc;

pub const GENERIC_PAYMENT_ERROR: &str = "Payment failed. Please try again.";

/// Drives intent creation then confirmation for one draft attempt.
///
/// `pay` never fails: every error becomes `PaymentResult::failed`. Nothing is
/// persisted here; the caller records the donation only after a success.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    backend: Arc<dyn IntentBackend>,
    confirmer: Arc<dyn PaymentConfirmer>,
}

impl PaymentOrchestrator {
    pub fn new(backend: Arc<dyn IntentBackend>, confirmer: Arc<dyn PaymentConfirmer>) -> Self {
        Self { backend, confirmer }
    }

    pub async fn pay(
        &self,
        draft: &DonationDraft,
        campaign: &Campaign,
        attempt: u32,
        payment_method: &PaymentMethodInput,
    ) -> PaymentResult {
        let title = Some(campaign.title.clone());
        let request = CreatePaymentIntentRequest {
            amount: serde_json::Value::from(draft.amount()),
            currency: draft.currency().to_string(),
            campaign_id: draft.campaign_id().to_string(),
            donation_data: Some(draft.donation_data()),
            idempotency_key: Some(idempotency_key(draft.draft_id(), attempt)),
        };

        let response = self.backend.request_payment_intent(request).await;
        let client_secret = match (response.success, response.client_secret) {
            (true, Some(secret)) => secret,
            (_, _) => {
                let error = non_empty(response.error);
                tracing::warn!(
                    draft_id = draft.draft_id(),
                    attempt,
                    error = error.as_deref().unwrap_or("<none>"),
                    "payment intent was not created"
                );
                return PaymentResult::failed(
                    error.unwrap_or_else(|| GENERIC_PAYMENT_ERROR.to_string()),
                    title,
                );
            }
        };

        match self
            .confirmer
            .confirm_payment(&client_secret, payment_method)
            .await
        {
            Ok(confirmed) if confirmed.is_succeeded() => {
                tracing::info!(
                    draft_id = draft.draft_id(),
                    transaction_id = %confirmed.payment_intent_id,
                    attempt,
                    "payment confirmed"
                );
                PaymentResult::succeeded(confirmed.payment_intent_id, title)
            }
            Ok(confirmed) => {
                tracing::warn!(
                    draft_id = draft.draft_id(),
                    status = %confirmed.status,
                    "payment confirmation did not succeed"
                );
                PaymentResult::failed(GENERIC_PAYMENT_ERROR, title)
            }
            Err(err) => {
                tracing::warn!(
                    draft_id = draft.draft_id(),
                    payment_intent_id = payment_intent_id_from_client_secret(&client_secret)
                        .unwrap_or("<unknown>"),
                    code = err.code.as_deref().unwrap_or("<none>"),
                    decline_code = err.decline_code.as_deref().unwrap_or("<none>"),
                    "payment confirmation failed"
                );
                PaymentResult::failed(
                    non_empty(Some(err.message)).unwrap_or_else(|| GENERIC_PAYMENT_ERROR.to_string()),
                    title,
                )
            }
        }
    }
}

/// Stable per (draft, attempt) so a resent request cannot create a second intent.
pub fn idempotency_key(draft_id: &str, attempt: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(draft_id.as_bytes());
    hasher.update(&attempt.to_le_bytes());
    format!("swiftcause-{}", &hasher.finalize().to_hex().as_str()[..32])
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedBackend, ScriptedConfirmer};
    use super::*;
    use crate::draft::DonationDraftBuilder;
    use crate::types::RecurringInterval;
    use std::sync::atomic::Ordering;

    fn campaign() -> Campaign {
        Campaign::new("camp-1", "School Meals", "usd", 1_000_000)
    }

    #[tokio::test]
    async fn confirmed_payment_yields_transaction_id() {
        let backend = Arc::new(ScriptedBackend::default());
        let orchestrator = PaymentOrchestrator::new(backend.clone(), Arc::new(ScriptedConfirmer));
        let draft = DonationDraftBuilder::new("camp-1", "usd")
            .amount_minor(10_000)
            .recurring(RecurringInterval::Monthly)
            .build()
            .unwrap();

        let result = orchestrator
            .pay(&draft, &campaign(), 1, &PaymentMethodInput::new("pm_card_visa"))
            .await;
        assert!(result.success);
        assert_eq!(result.transaction_id.as_deref(), Some("pi_1"));
        assert_eq!(result.campaign_title.as_deref(), Some("School Meals"));

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].amount, serde_json::json!(10_000));
        let data = requests[0].donation_data.as_ref().unwrap();
        assert_eq!(data.recurring_interval, Some(RecurringInterval::Monthly));
    }

    #[tokio::test]
    async fn decline_surfaces_provider_message() {
        let orchestrator = PaymentOrchestrator::new(
            Arc::new(ScriptedBackend::default()),
            Arc::new(ScriptedConfirmer),
        );
        let draft = DonationDraftBuilder::new("camp-1", "usd")
            .amount_minor(5_000)
            .build()
            .unwrap();

        let result = orchestrator
            .pay(&draft, &campaign(), 1, &PaymentMethodInput::new("pm_card_chargeDeclined"))
            .await;
        assert!(!result.success);
        assert!(result.transaction_id.is_none());
        assert_eq!(result.error.as_deref(), Some("Your card was declined."));
    }

    #[tokio::test]
    async fn backend_rejection_without_message_uses_fallback() {
        let backend = Arc::new(ScriptedBackend {
            reject_with: Some(String::new()),
            ..ScriptedBackend::default()
        });
        let orchestrator = PaymentOrchestrator::new(backend.clone(), Arc::new(ScriptedConfirmer));
        let draft = DonationDraftBuilder::new("camp-1", "usd")
            .amount_minor(5_000)
            .build()
            .unwrap();

        let result = orchestrator
            .pay(&draft, &campaign(), 1, &PaymentMethodInput::new("pm_card_visa"))
            .await;
        assert_eq!(result.error.as_deref(), Some(GENERIC_PAYMENT_ERROR));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idempotency_key_changes_per_attempt() {
        assert_eq!(idempotency_key("d-1", 1), idempotency_key("d-1", 1));
        assert_ne!(idempotency_key("d-1", 1), idempotency_key("d-1", 2));
        assert_ne!(idempotency_key("d-1", 1), idempotency_key("d-2", 1));
    }
}
