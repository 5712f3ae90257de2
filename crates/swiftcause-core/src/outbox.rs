//! Durable queue for best-effort side effects.
//!
//! Gift Aid declarations and receipt emails are enqueued here instead of being
//! written inline, so a failing write never reaches the donor and is retried on
//! its own schedule.

use crate::error::SwiftCauseError;
use crate::types::GiftAidDeclaration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("outbox serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<OutboxError> for SwiftCauseError {
    fn from(err: OutboxError) -> Self {
        SwiftCauseError::Outbox(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxTask {
    RecordGiftAid { declaration: GiftAidDeclaration },
    #[serde(rename_all = "camelCase")]
    DonationReceipt { donation_id: String },
}

impl OutboxTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RecordGiftAid { .. } => "record_gift_aid",
            Self::DonationReceipt { .. } => "donation_receipt",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub task: OutboxTask,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: EntryStatus,
}

/// Exponential backoff with a ceiling and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempts` failures.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}

/// Executes outbox tasks. Implementations must tolerate redelivery.
#[async_trait]
pub trait OutboxDispatcher: Send + Sync {
    async fn dispatch(&self, task: &OutboxTask) -> Result<(), SwiftCauseError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct OutboxData {
    entries: BTreeMap<String, OutboxEntry>,
}

#[derive(Debug)]
struct OutboxState {
    path: Option<PathBuf>,
    data: OutboxData,
}

impl OutboxState {
    fn persist(&self) -> Result<(), OutboxError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.data)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

/// Pending side effects, optionally mirrored to a JSON file after every mutation.
#[derive(Debug)]
pub struct Outbox {
    policy: RetryPolicy,
    state: Mutex<OutboxState>,
}

impl Outbox {
    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(OutboxState {
                path: None,
                data: OutboxData::default(),
            }),
        }
    }

    pub fn load(path: impl Into<PathBuf>, policy: RetryPolicy) -> Result<Self, OutboxError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                OutboxData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            OutboxData::default()
        };

        Ok(Self {
            policy,
            state: Mutex::new(OutboxState {
                path: Some(path),
                data,
            }),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.state.lock().await.path.clone()
    }

    pub async fn enqueue(&self, task: OutboxTask) -> Result<String, OutboxError> {
        let now = Utc::now();
        let entry = OutboxEntry {
            id: Uuid::new_v4().to_string(),
            task,
            attempts: 0,
            enqueued_at: now,
            next_attempt_at: now,
            last_error: None,
            status: EntryStatus::Pending,
        };
        let id = entry.id.clone();

        let mut state = self.state.lock().await;
        tracing::debug!(entry_id = %id, task = entry.task.name(), "outbox task enqueued");
        state.data.entries.insert(id.clone(), entry);
        if let Err(err) = state.persist() {
            state.data.entries.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    pub async fn list(&self) -> Vec<OutboxEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<OutboxEntry> = state.data.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.enqueued_at);
        entries
    }

    pub async fn pending_count(&self) -> usize {
        self.count(EntryStatus::Pending).await
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.count(EntryStatus::DeadLetter).await
    }

    async fn count(&self, status: EntryStatus) -> usize {
        self.state
            .lock()
            .await
            .data
            .entries
            .values()
            .filter(|entry| entry.status == status)
            .count()
    }

    /// Put a dead-lettered entry back in the queue with a fresh attempt budget.
    pub async fn requeue(&self, entry_id: &str) -> Result<bool, OutboxError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.data.entries.get_mut(entry_id) else {
            return Ok(false);
        };
        if entry.status != EntryStatus::DeadLetter {
            return Ok(false);
        }
        entry.status = EntryStatus::Pending;
        entry.attempts = 0;
        entry.next_attempt_at = Utc::now();
        state.persist()?;
        Ok(true)
    }

    /// Dispatch every pending entry due at `now`.
    ///
    /// The lock is released while tasks run, so enqueues are never blocked by a
    /// slow dispatcher.
    pub async fn drain_due(
        &self,
        dispatcher: &dyn OutboxDispatcher,
        now: DateTime<Utc>,
    ) -> Result<DrainReport, OutboxError> {
        let due: Vec<OutboxEntry> = {
            let state = self.state.lock().await;
            state
                .data
                .entries
                .values()
                .filter(|entry| entry.status == EntryStatus::Pending && entry.next_attempt_at <= now)
                .cloned()
                .collect()
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for entry in &due {
            let outcome = dispatcher.dispatch(&entry.task).await;
            outcomes.push((entry.id.clone(), outcome));
        }

        let mut report = DrainReport::default();
        let mut state = self.state.lock().await;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    state.data.entries.remove(&id);
                    report.delivered += 1;
                }
                Err(err) => {
                    let Some(entry) = state.data.entries.get_mut(&id) else {
                        continue;
                    };
                    entry.attempts += 1;
                    entry.last_error = Some(err.to_string());
                    if self.policy.is_exhausted(entry.attempts) {
                        entry.status = EntryStatus::DeadLetter;
                        report.dead_lettered += 1;
                        tracing::error!(
                            entry_id = %id,
                            task = entry.task.name(),
                            attempts = entry.attempts,
                            error = %err,
                            "outbox task dead-lettered"
                        );
                    } else {
                        let delay = self.policy.delay_after(entry.attempts);
                        entry.next_attempt_at = now
                            + chrono::Duration::milliseconds(delay.as_millis() as i64);
                        report.rescheduled += 1;
                        tracing::warn!(
                            entry_id = %id,
                            task = entry.task.name(),
                            attempts = entry.attempts,
                            retry_in_secs = delay.as_secs(),
                            error = %err,
                            "outbox task failed; rescheduled"
                        );
                    }
                }
            }
        }
        if !due.is_empty() {
            state.persist()?;
        }
        Ok(report)
    }
}

/// Location helper for file-backed outboxes inside a data directory.
pub fn default_outbox_path(data_dir: &Path) -> PathBuf {
    data_dir.join("outbox.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingDispatcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OutboxDispatcher for FailingDispatcher {
        async fn dispatch(&self, _task: &OutboxTask) -> Result<(), SwiftCauseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SwiftCauseError::Storage("firestore unavailable".to_string()))
        }
    }

    struct OkDispatcher;

    #[async_trait]
    impl OutboxDispatcher for OkDispatcher {
        async fn dispatch(&self, _task: &OutboxTask) -> Result<(), SwiftCauseError> {
            Ok(())
        }
    }

    fn receipt(id: &str) -> OutboxTask {
        OutboxTask::DonationReceipt {
            donation_id: id.to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(4), Duration::from_secs(40));
        assert_eq!(policy.delay_after(20), Duration::from_secs(600));
        assert!(policy.is_exhausted(5));
        assert!(!policy.is_exhausted(4));
    }

    #[tokio::test]
    async fn successful_dispatch_removes_entry() {
        let outbox = Outbox::in_memory(RetryPolicy::default());
        outbox.enqueue(receipt("d-1")).await.unwrap();

        let report = outbox.drain_due(&OkDispatcher, Utc::now()).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(outbox.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failures_back_off_then_dead_letter() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let outbox = Outbox::in_memory(policy);
        let id = outbox.enqueue(receipt("d-2")).await.unwrap();
        let dispatcher = FailingDispatcher {
            calls: AtomicUsize::new(0),
        };

        let now = Utc::now();
        let report = outbox.drain_due(&dispatcher, now).await.unwrap();
        assert_eq!(report.rescheduled, 1);

        // Not yet due again.
        let report = outbox.drain_due(&dispatcher, now).await.unwrap();
        assert_eq!(report, DrainReport::default());

        let later = now + chrono::Duration::seconds(6);
        let report = outbox.drain_due(&dispatcher, later).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outbox.dead_letter_count().await, 1);

        let entry = outbox.list().await.remove(0);
        assert_eq!(entry.last_error.as_deref(), Some("Storage error: firestore unavailable"));

        assert!(outbox.requeue(&id).await.unwrap());
        assert_eq!(outbox.pending_count().await, 1);
    }

    #[tokio::test]
    async fn file_outbox_survives_reload() {
        let dir = std::env::temp_dir().join(format!("swiftcause-outbox-{}", Uuid::new_v4()));
        let path = default_outbox_path(&dir);

        let outbox = Outbox::load(&path, RetryPolicy::default()).unwrap();
        outbox.enqueue(receipt("d-3")).await.unwrap();

        let reloaded = Outbox::load(&path, RetryPolicy::default()).unwrap();
        let entries = reloaded.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task, receipt("d-3"));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unwritable_outbox_rejects_enqueue() {
        let dir = std::env::temp_dir().join(format!("swiftcause-outbox-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("blocker");
        fs::write(&blocker, b"file").unwrap();

        // Parent "directory" is a regular file.
        let outbox = Outbox::load(blocker.join("outbox.json"), RetryPolicy::default()).unwrap();
        assert!(outbox.enqueue(receipt("d-4")).await.is_err());
        assert_eq!(outbox.list().await.len(), 0);

        let _ = fs::remove_dir_all(dir);
    }
}
