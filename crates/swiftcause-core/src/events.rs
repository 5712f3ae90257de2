//! Donation change stream.
//!
//! The recorder publishes here after every committed write; the receipt trigger
//! and any other asynchronous consumers subscribe.

use crate::types::Donation;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DonationEvent {
    Created(Donation),
    Updated { before: Donation, after: Donation },
}

impl DonationEvent {
    pub fn donation(&self) -> &Donation {
        match self {
            Self::Created(donation) => donation,
            Self::Updated { after, .. } => after,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated { .. } => "updated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DonationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DonationEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: DonationEvent) {
        debug!(
            kind = event.kind(),
            donation_id = %event.donation().id,
            "publishing donation event"
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
