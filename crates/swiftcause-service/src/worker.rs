//! Background tasks: receipt trigger and outbox drain loop.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use swiftcause_core::notify::run_receipt_trigger;
use swiftcause_core::{DrainReport, EventBus, Outbox, OutboxDispatcher};
use tokio::task::JoinHandle;

/// Subscribes before spawning so no event published after this call is missed.
pub fn spawn_receipt_trigger(events: &EventBus, outbox: Arc<Outbox>) -> JoinHandle<()> {
    let rx = events.subscribe();
    tokio::spawn(run_receipt_trigger(rx, outbox))
}

pub async fn drain_once(outbox: &Outbox, dispatcher: &dyn OutboxDispatcher) -> DrainReport {
    match outbox.drain_due(dispatcher, Utc::now()).await {
        Ok(report) => {
            if report != DrainReport::default() {
                tracing::info!(
                    delivered = report.delivered,
                    rescheduled = report.rescheduled,
                    dead_lettered = report.dead_lettered,
                    "outbox drained"
                );
            }
            report
        }
        Err(err) => {
            tracing::error!(error = %err, "outbox drain failed to persist");
            DrainReport::default()
        }
    }
}

pub fn spawn_outbox_worker<D>(
    outbox: Arc<Outbox>,
    dispatcher: D,
    poll_interval: Duration,
) -> JoinHandle<()>
where
    D: OutboxDispatcher + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            drain_once(&outbox, &dispatcher).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftcause_core::{
        Donation, DonationData, DonationRecorder, InMemoryStore, MailSettings, RetryPolicy,
        SideEffectDispatcher,
    };

    #[tokio::test]
    async fn recorded_donation_with_email_ends_up_in_mail_queue() {
        let store = Arc::new(InMemoryStore::new());
        let events = EventBus::new();
        let outbox = Arc::new(Outbox::in_memory(RetryPolicy::default()));
        let trigger = spawn_receipt_trigger(&events, outbox.clone());

        let recorder = DonationRecorder::new(store.clone(), events.clone());
        let data = DonationData {
            donor_email: Some("donor@example.org".to_string()),
            ..DonationData::default()
        };
        let donation =
            Donation::from_provider("pi_worker", "camp-1", 2_500, "gbp", &data, Utc::now()).unwrap();
        recorder.record(donation).await.unwrap();

        for _ in 0..50 {
            if outbox.pending_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outbox.pending_count().await, 1);

        let dispatcher = SideEffectDispatcher::new(
            store.clone(),
            MailSettings {
                from: "receipts@swiftcause.org".to_string(),
            },
        );
        let report = drain_once(&outbox, &dispatcher).await;
        assert_eq!(report.delivered, 1);

        let mail = swiftcause_core::DonationStore::list_mail(store.as_ref()).await.unwrap();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].to, "donor@example.org");
        trigger.abort();
    }
}
