use crate::campaign::CampaignLookup;
use crate::draft::DonationDraftBuilder;
use crate::error::SwiftCauseError;
use crate::flow::{DonationFlow, DonationStage};
use crate::gateway::PaymentMethodInput;
use crate::giftaid::GiftAidRecorder;
use crate::orchestrator::PaymentOrchestrator;
use crate::policy::{AccessPolicy, Action, Resource};
use crate::recorder::DonationRecorder;
use crate::resolver::Outcome;
use crate::session::Session;
use crate::types::{Campaign, Donation, DonationDraft, PaymentResult};

/// Collaborators shared by every checkout in the process.
#[derive(Clone)]
pub struct CheckoutServices {
    pub campaigns: CampaignLookup,
    pub orchestrator: PaymentOrchestrator,
    pub recorder: DonationRecorder,
    pub gift_aid: GiftAidRecorder,
}

struct InFlight {
    draft: DonationDraft,
    campaign: Campaign,
    flow: DonationFlow,
    result: Option<PaymentResult>,
    donation_id: Option<String>,
}

/// Session-scoped donation flow holding at most one draft.
///
/// The draft lives only in this slot until payment succeeds; abandoning the
/// checkout leaves nothing behind in the store.
pub struct DonationCheckout {
    session: Session,
    services: CheckoutServices,
    slot: Option<InFlight>,
}

impl DonationCheckout {
    pub fn new(session: Session, services: CheckoutServices) -> Self {
        Self {
            session,
            services,
            slot: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn draft(&self) -> Option<&DonationDraft> {
        self.slot.as_ref().map(|s| &s.draft)
    }

    pub fn stage(&self) -> Option<DonationStage> {
        self.slot.as_ref().map(|s| s.flow.stage())
    }

    pub fn last_result(&self) -> Option<&PaymentResult> {
        self.slot.as_ref().and_then(|s| s.result.as_ref())
    }

    /// Validate input into a fresh draft for this session.
    pub async fn start(
        &mut self,
        builder: DonationDraftBuilder,
    ) -> Result<&DonationDraft, SwiftCauseError> {
        if self.stage() == Some(DonationStage::Confirming) {
            return Err(SwiftCauseError::InvariantViolation(
                "a donation is already being confirmed for this session".to_string(),
            ));
        }

        AccessPolicy::authorize(&self.session, Resource::KioskCheckout, Action::Donate)?;
        AccessPolicy::authorize_campaign(&self.session, builder.campaign_id())?;

        let campaign = self
            .services
            .campaigns
            .open_for_donations(builder.campaign_id())
            .await?;
        if let (Some(session_org), Some(campaign_org)) =
            (&self.session.organization_id, &campaign.organization_id)
        {
            if session_org != campaign_org {
                return Err(SwiftCauseError::Forbidden(format!(
                    "campaign '{}' belongs to another organization",
                    campaign.id
                )));
            }
        }

        let mut builder = builder;
        if let Some(kiosk_id) = self.session.kiosk_id() {
            builder = builder.kiosk(kiosk_id);
        }
        if let Some(org) = campaign
            .organization_id
            .clone()
            .or_else(|| self.session.organization_id.clone())
        {
            builder = builder.organization(org);
        }
        let draft = builder.build()?;

        tracing::debug!(
            session_id = %self.session.session_id,
            draft_id = draft.draft_id(),
            campaign_id = draft.campaign_id(),
            amount = draft.amount(),
            "donation draft started"
        );
        let flow = DonationFlow::new(draft.draft_id());
        let slot = self.slot.insert(InFlight {
            draft,
            campaign,
            flow,
            result: None,
            donation_id: None,
        });
        Ok(&slot.draft)
    }

    /// Drafting -> Confirming -> Succeeded | Failed.
    pub async fn submit(
        &mut self,
        payment_method: &PaymentMethodInput,
    ) -> Result<Outcome, SwiftCauseError> {
        self.in_flight_mut()?.flow.submit()?;
        self.confirm(payment_method).await
    }

    /// Failed -> Confirming with the same draft, so campaign and donor fields carry over.
    pub async fn retry(
        &mut self,
        payment_method: &PaymentMethodInput,
    ) -> Result<Outcome, SwiftCauseError> {
        self.in_flight_mut()?.flow.retry()?;
        self.confirm(payment_method).await
    }

    async fn confirm(
        &mut self,
        payment_method: &PaymentMethodInput,
    ) -> Result<Outcome, SwiftCauseError> {
        let services = self.services.clone();
        let slot = self.in_flight_mut()?;

        let result = services
            .orchestrator
            .pay(&slot.draft, &slot.campaign, slot.flow.attempts(), payment_method)
            .await;

        match &result.transaction_id {
            Some(transaction_id) if result.success => {
                slot.flow.mark_succeeded()?;
                let donation = Donation::from_draft(&slot.draft, transaction_id.clone());
                match services.recorder.record(donation).await {
                    Ok(recorded) => slot.donation_id = Some(recorded.donation().id.clone()),
                    // The provider webhook records the same transaction idempotently.
                    Err(err) => tracing::error!(
                        transaction_id = %transaction_id,
                        error = %err,
                        "donation write failed after successful payment"
                    ),
                }
                services
                    .gift_aid
                    .record_after_payment(&slot.draft, &result, &slot.campaign.title)
                    .await;
            }
            _ => {
                slot.flow.mark_failed()?;
                tracing::info!(
                    draft_id = slot.draft.draft_id(),
                    attempt = slot.flow.attempts(),
                    error = result.error.as_deref().unwrap_or_default(),
                    "donation attempt failed; nothing persisted"
                );
            }
        }

        let outcome = Outcome::resolve(&result);
        slot.result = Some(result);
        Ok(outcome)
    }

    /// Attach an email to the donation this checkout just recorded.
    pub async fn email_receipt(&mut self, email: &str) -> Result<Donation, SwiftCauseError> {
        let slot = self.in_flight_mut()?;
        if slot.flow.stage() != DonationStage::Succeeded {
            return Err(SwiftCauseError::stage_violation(
                DonationStage::Succeeded.name(),
                slot.flow.stage().name(),
            ));
        }
        let donation_id = slot.donation_id.clone().ok_or_else(|| {
            SwiftCauseError::not_found("no stored donation for this checkout")
        })?;
        self.services
            .recorder
            .attach_donor_email(&donation_id, email)
            .await
    }

    /// Leave the result screen. The next donation starts from a clean draft.
    pub fn return_to_start(&mut self) {
        self.slot = None;
    }

    /// Drop the draft without notifying the provider; an open intent is simply abandoned.
    pub fn abandon(&mut self) {
        if let Some(slot) = self.slot.take() {
            tracing::debug!(
                draft_id = slot.draft.draft_id(),
                stage = slot.flow.stage().name(),
                "donation draft abandoned"
            );
        }
    }

    fn in_flight_mut(&mut self) -> Result<&mut InFlight, SwiftCauseError> {
        self.slot.as_mut().ok_or_else(|| {
            SwiftCauseError::InvariantViolation("no donation draft in progress".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::sample_gift_aid;
    use crate::events::{DonationEvent, EventBus};
    use crate::notify::{MailSettings, SideEffectDispatcher};
    use crate::orchestrator::testing::{ScriptedBackend, ScriptedConfirmer};
    use crate::outbox::{Outbox, OutboxDispatcher, OutboxTask, RetryPolicy};
    use crate::resolver::OutcomeAction;
    use crate::session::Role;
    use crate::store::{DonationStore, InMemoryStore};
    use crate::types::{PaymentStatus, RecurringInterval};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;

    struct Harness {
        store: Arc<InMemoryStore>,
        outbox: Arc<Outbox>,
        backend: Arc<ScriptedBackend>,
        events: EventBus,
        services: CheckoutServices,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_campaign(
                &Campaign::new("camp-1", "Clean Water", "usd", 1_000_000).with_organization("org-1"),
            )
            .await
            .unwrap();
        let outbox = Arc::new(Outbox::in_memory(RetryPolicy::default()));
        let backend = Arc::new(ScriptedBackend::default());
        let events = EventBus::new();
        let services = CheckoutServices {
            campaigns: CampaignLookup::new(store.clone()),
            orchestrator: PaymentOrchestrator::new(backend.clone(), Arc::new(ScriptedConfirmer)),
            recorder: DonationRecorder::new(store.clone(), events.clone()),
            gift_aid: GiftAidRecorder::new(outbox.clone()),
        };
        Harness {
            store,
            outbox,
            backend,
            events,
            services,
        }
    }

    fn kiosk_session() -> Session {
        Session::kiosk("kiosk-1", Some("org-1".to_string()), vec![])
    }

    #[tokio::test]
    async fn fifty_dollar_one_time_donation_is_recorded() {
        let h = harness().await;
        let mut checkout = DonationCheckout::new(kiosk_session(), h.services.clone());
        checkout
            .start(DonationDraftBuilder::new("camp-1", "usd").amount_major(50.0))
            .await
            .unwrap();

        let outcome = checkout
            .submit(&PaymentMethodInput::new("pm_card_visa"))
            .await
            .unwrap();
        assert!(outcome.is_success());

        let donations = h.store.list_donations("camp-1").await.unwrap();
        assert_eq!(donations.len(), 1);
        let donation = &donations[0];
        assert_eq!(donation.amount, 5_000);
        assert!(!donation.is_recurring);
        assert!(!donation.is_gift_aid);
        assert_eq!(donation.payment_status, PaymentStatus::Success);
        assert_eq!(donation.kiosk_id.as_deref(), Some("kiosk-1"));
        assert_eq!(donation.organization_id.as_deref(), Some("org-1"));

        let campaign = h.store.get_campaign("camp-1").await.unwrap().unwrap();
        assert_eq!(campaign.collected_amount, 5_000);
        assert_eq!(campaign.donation_count, 1);
    }

    #[tokio::test]
    async fn hundred_dollar_monthly_donation_keeps_interval() {
        let h = harness().await;
        let mut checkout = DonationCheckout::new(kiosk_session(), h.services.clone());
        checkout
            .start(
                DonationDraftBuilder::new("camp-1", "usd")
                    .amount_minor(10_000)
                    .recurring(RecurringInterval::Monthly),
            )
            .await
            .unwrap();
        checkout
            .submit(&PaymentMethodInput::new("pm_card_visa"))
            .await
            .unwrap();

        let donation = &h.store.list_donations("camp-1").await.unwrap()[0];
        assert!(donation.is_recurring);
        assert_eq!(donation.recurring_interval, Some(RecurringInterval::Monthly));
    }

    #[tokio::test]
    async fn decline_writes_nothing_and_retry_reuses_draft() {
        let h = harness().await;
        let mut checkout = DonationCheckout::new(kiosk_session(), h.services.clone());
        let draft_id = checkout
            .start(
                DonationDraftBuilder::new("camp-1", "usd")
                    .amount_minor(2_500)
                    .donor_name("Grace"),
            )
            .await
            .unwrap()
            .draft_id()
            .to_string();

        let outcome = checkout
            .submit(&PaymentMethodInput::new("pm_card_chargeDeclined"))
            .await
            .unwrap();
        match &outcome {
            Outcome::Failure { error, .. } => assert_eq!(error, "Your card was declined."),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(outcome.allows(OutcomeAction::Retry));
        assert!(h.store.list_donations("camp-1").await.unwrap().is_empty());
        assert_eq!(checkout.stage(), Some(DonationStage::Failed));

        let outcome = checkout
            .retry(&PaymentMethodInput::new("pm_card_visa"))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(checkout.draft().unwrap().draft_id(), draft_id);

        let requests = h.backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].campaign_id, requests[1].campaign_id);
        assert_eq!(requests[0].donation_data, requests[1].donation_data);
        assert_ne!(requests[0].idempotency_key, requests[1].idempotency_key);
        drop(requests);

        let donations = h.store.list_donations("camp-1").await.unwrap();
        assert_eq!(donations.len(), 1);
        assert_eq!(donations[0].donor_name.as_deref(), Some("Grace"));
    }

    struct BrokenGiftAidStore;

    #[async_trait]
    impl OutboxDispatcher for BrokenGiftAidStore {
        async fn dispatch(&self, task: &OutboxTask) -> Result<(), SwiftCauseError> {
            match task {
                OutboxTask::RecordGiftAid { .. } => {
                    Err(SwiftCauseError::Storage("declaration write rejected".to_string()))
                }
                OutboxTask::DonationReceipt { .. } => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn gift_aid_write_failure_keeps_donation_successful() {
        let h = harness().await;
        let mut checkout = DonationCheckout::new(kiosk_session(), h.services.clone());
        checkout
            .start(
                DonationDraftBuilder::new("camp-1", "usd")
                    .amount_minor(4_000)
                    .gift_aid(sample_gift_aid()),
            )
            .await
            .unwrap();
        let outcome = checkout
            .submit(&PaymentMethodInput::new("pm_card_visa"))
            .await
            .unwrap();
        assert!(outcome.is_success());

        let report = h.outbox.drain_due(&BrokenGiftAidStore, Utc::now()).await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let donations = h.store.list_donations("camp-1").await.unwrap();
        assert_eq!(donations.len(), 1);
        assert!(donations[0].is_gift_aid);
        assert_eq!(donations[0].payment_status, PaymentStatus::Success);
        assert!(h.store.list_gift_aid().await.unwrap().is_empty());

        // A healthy dispatcher later records the declaration against the stored donation.
        let dispatcher = SideEffectDispatcher::new(
            h.store.clone(),
            MailSettings {
                from: "receipts@swiftcause.org".to_string(),
            },
        );
        let later = Utc::now() + chrono::Duration::minutes(1);
        h.outbox.drain_due(&dispatcher, later).await.unwrap();
        let declarations = h.store.list_gift_aid().await.unwrap();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].transaction_id, donations[0].transaction_id);
        assert_eq!(declarations[0].campaign_title, "Clean Water");
    }

    #[tokio::test]
    async fn email_receipt_after_success_publishes_update() {
        let h = harness().await;
        let mut rx = h.events.subscribe();
        let mut checkout = DonationCheckout::new(kiosk_session(), h.services.clone());
        checkout
            .start(DonationDraftBuilder::new("camp-1", "usd").amount_minor(1_000))
            .await
            .unwrap();

        assert!(checkout.email_receipt("ada@example.org").await.is_err());

        checkout
            .submit(&PaymentMethodInput::new("pm_card_visa"))
            .await
            .unwrap();
        let donation = checkout.email_receipt("ada@example.org").await.unwrap();
        assert_eq!(donation.donor_email.as_deref(), Some("ada@example.org"));

        assert!(matches!(rx.try_recv(), Ok(DonationEvent::Created(_))));
        assert!(matches!(rx.try_recv(), Ok(DonationEvent::Updated { .. })));

        checkout.return_to_start();
        assert!(checkout.draft().is_none());
        assert!(checkout.last_result().is_none());
    }

    #[tokio::test]
    async fn non_checkout_roles_and_foreign_campaigns_are_rejected() {
        let h = harness().await;
        let viewer = Session::admin("u-1", Role::Viewer, Some("org-1".to_string()));
        let mut checkout = DonationCheckout::new(viewer, h.services.clone());
        assert!(matches!(
            checkout
                .start(DonationDraftBuilder::new("camp-1", "usd").amount_minor(100))
                .await,
            Err(SwiftCauseError::Forbidden(_))
        ));

        let other_org = Session::kiosk("kiosk-9", Some("org-2".to_string()), vec![]);
        let mut checkout = DonationCheckout::new(other_org, h.services.clone());
        assert!(matches!(
            checkout
                .start(DonationDraftBuilder::new("camp-1", "usd").amount_minor(100))
                .await,
            Err(SwiftCauseError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn submit_without_draft_is_an_invariant_violation() {
        let h = harness().await;
        let mut checkout = DonationCheckout::new(kiosk_session(), h.services);
        assert!(matches!(
            checkout.submit(&PaymentMethodInput::new("pm_card_visa")).await,
            Err(SwiftCauseError::InvariantViolation(_))
        ));
    }
}
