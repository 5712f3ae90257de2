//! Receipt emails, triggered by donation events and delivered through the outbox.
//!
//! Nothing here sends mail. A `mail/{id}` document is written for an external
//! sender to pick up.

use crate::campaign::CampaignLookup;
use crate::error::SwiftCauseError;
use crate::events::DonationEvent;
use crate::giftaid::persist_declaration;
use crate::outbox::{Outbox, OutboxDispatcher, OutboxTask};
use crate::store::DonationStore;
use crate::types::{Donation, GiftAidDeclaration, MailContent, MailMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const FALLBACK_CAMPAIGN_TITLE: &str = "SwiftCause campaign";

/// Receipt task for an event, if the event calls for one.
///
/// Fires for new donations that carry an email and for updates where the
/// email went from absent to present.
pub fn receipt_task(event: &DonationEvent) -> Option<OutboxTask> {
    let fire = match event {
        DonationEvent::Created(donation) => donation.has_donor_email(),
        DonationEvent::Updated { before, after } => {
            !before.has_donor_email() && after.has_donor_email()
        }
    };
    fire.then(|| OutboxTask::DonationReceipt {
        donation_id: event.donation().id.clone(),
    })
}

/// Turns donation events into receipt tasks until the bus closes.
pub async fn run_receipt_trigger(mut rx: broadcast::Receiver<DonationEvent>, outbox: Arc<Outbox>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(task) = receipt_task(&event) else {
                    continue;
                };
                if let Err(err) = outbox.enqueue(task).await {
                    tracing::error!(
                        donation_id = %event.donation().id,
                        error = %err,
                        "failed to enqueue donation receipt"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "receipt trigger lagged behind donation events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("donation event bus closed; receipt trigger stopping");
                break;
            }
        }
    }
}

/// Amount in major units with the currency symbol where one is known.
pub fn format_amount(amount: u64, currency: &str) -> String {
    let major = amount / 100;
    let minor = amount % 100;
    match currency.to_ascii_lowercase().as_str() {
        "gbp" => format!("£{major}.{minor:02}"),
        "usd" => format!("${major}.{minor:02}"),
        "eur" => format!("€{major}.{minor:02}"),
        other => format!("{major}.{minor:02} {}", other.to_ascii_uppercase()),
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn render_receipt(donation: &Donation, campaign_title: &str) -> MailContent {
    let amount = format_amount(donation.amount, &donation.currency);
    let greeting = donation
        .donor_name
        .as_deref()
        .filter(|name| !name.trim().is_empty() && !donation.is_anonymous)
        .unwrap_or("friend");

    let mut notes = Vec::new();
    if let Some(interval) = donation.recurring_interval.filter(|_| donation.is_recurring) {
        notes.push(format!(
            "This is a {} recurring donation. You can change or cancel it at any time.",
            interval.as_str()
        ));
    }
    if donation.is_gift_aid {
        let extra = format_amount(
            GiftAidDeclaration::reclaim_value(donation.amount),
            &donation.currency,
        );
        notes.push(format!(
            "Thanks to your Gift Aid declaration, {campaign_title} can claim an extra {extra} at no cost to you."
        ));
    }

    let subject = format!("Thank you for supporting {campaign_title}");

    let mut text = format!(
        "Dear {greeting},\n\nThank you for your donation of {amount} to {campaign_title}.\n"
    );
    for note in &notes {
        text.push('\n');
        text.push_str(note);
        text.push('\n');
    }
    text.push_str(&format!(
        "\nTransaction reference: {}\n\nWith gratitude,\nThe SwiftCause team\n",
        donation.transaction_id
    ));

    let mut html = format!(
        "<p>Dear {},</p><p>Thank you for your donation of <strong>{}</strong> to {}.</p>",
        escape_html(greeting),
        escape_html(&amount),
        escape_html(campaign_title)
    );
    for note in &notes {
        html.push_str(&format!("<p>{}</p>", escape_html(note)));
    }
    html.push_str(&format!(
        "<p>Transaction reference: <code>{}</code></p><p>With gratitude,<br>The SwiftCause team</p>",
        escape_html(&donation.transaction_id)
    ));

    MailContent { subject, text, html }
}

/// Sender identity for queued receipts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub from: String,
}

/// Executes outbox tasks against the document store.
#[derive(Clone)]
pub struct SideEffectDispatcher {
    store: Arc<dyn DonationStore>,
    campaigns: CampaignLookup,
    mail: MailSettings,
}

impl SideEffectDispatcher {
    pub fn new(store: Arc<dyn DonationStore>, mail: MailSettings) -> Self {
        Self {
            campaigns: CampaignLookup::new(store.clone()),
            store,
            mail,
        }
    }

    async fn queue_receipt(&self, donation_id: &str) -> Result<(), SwiftCauseError> {
        let donation = self
            .store
            .get_donation(donation_id)
            .await?
            .ok_or_else(|| SwiftCauseError::not_found(format!("donation '{}'", donation_id)))?;
        let Some(to) = donation.donor_email.clone().filter(|e| !e.trim().is_empty()) else {
            tracing::debug!(donation_id, "donation has no email; receipt skipped");
            return Ok(());
        };

        let title = self
            .campaigns
            .title_or(&donation.campaign_id, FALLBACK_CAMPAIGN_TITLE)
            .await;
        let mail = MailMessage {
            id: format!("receipt-{}", donation.id),
            to,
            from: self.mail.from.clone(),
            message: render_receipt(&donation, &title),
            donation_id: donation.id.clone(),
            created_at: Utc::now(),
        };
        if self.store.enqueue_mail(&mail).await? {
            tracing::info!(donation_id, mail_id = %mail.id, "receipt queued");
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxDispatcher for SideEffectDispatcher {
    async fn dispatch(&self, task: &OutboxTask) -> Result<(), SwiftCauseError> {
        match task {
            OutboxTask::RecordGiftAid { declaration } => {
                persist_declaration(self.store.as_ref(), declaration).await
            }
            OutboxTask::DonationReceipt { donation_id } => self.queue_receipt(donation_id).await,
        }
    }
}
