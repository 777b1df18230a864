//! Outbox entry model and state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use steward_core::{EntryId, WorkerId};

use crate::error::OutboxError;

/// Upper bound on `last_error`, in characters.
pub const MAX_ERROR_LEN: usize = 500;

/// Default retry budget enforced by stores.
pub const MAX_RETRY: u32 = 5;

/// Lifecycle status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for `available_at` and a relay claim
    Pending,
    /// Claimed by a relay worker, handler in flight
    Sending,
    /// Delivered
    Sent,
    /// Rejected as non-retryable; will never succeed as-is
    Failed,
    /// Retry budget exhausted; needs an operator
    DeadLetter,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Sending,
        OutboxStatus::Sent,
        OutboxStatus::Failed,
        OutboxStatus::DeadLetter,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Sent | OutboxStatus::Failed | OutboxStatus::DeadLetter
        )
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(&self, to: OutboxStatus) -> bool {
        use OutboxStatus::*;
        matches!(
            (*self, to),
            (Pending, Sending)
                | (Sending, Sent)
                | (Sending, Pending)
                | (Sending, DeadLetter)
                | (Sending, Failed)
        )
    }

    /// Storage representation (`status` column).
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status: {s}")))
    }
}

/// One unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: EntryId,
    /// Job family; each queue has its own relay
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Natural key used to collapse duplicate enqueues
    pub dedup_key: Option<String>,
    pub status: OutboxStatus,
    pub available_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Build the `Pending` entry an enqueue inserts.
    pub fn pending(job: OutboxJob, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            dedup_key: job.dedup_key,
            status: OutboxStatus::Pending,
            available_at: now,
            retry_count: 0,
            last_error: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.available_at <= now
    }

    /// Lock is held exactly while the entry is `Sending`.
    pub fn lock_is_consistent(&self) -> bool {
        let locked = self.locked_by.is_some() && self.locked_at.is_some();
        let unlocked = self.locked_by.is_none() && self.locked_at.is_none();
        if self.status == OutboxStatus::Sending {
            locked
        } else {
            unlocked
        }
    }

    pub(crate) fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sending;
        self.locked_by = Some(worker.clone());
        self.locked_at = Some(now);
    }

    pub(crate) fn release(&mut self, status: OutboxStatus) {
        self.status = status;
        self.locked_by = None;
        self.locked_at = None;
    }
}

/// Descriptor passed to `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxJob {
    pub id: EntryId,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
}

impl OutboxJob {
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EntryId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            dedup_key: None,
        }
    }

    /// Serialize a typed payload into a job.
    pub fn typed<P: Serialize>(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: &P,
    ) -> Result<Self, OutboxError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| OutboxError::Payload(format!("payload serialization failed: {e}")))?;
        Ok(Self::new(queue, job_type, payload))
    }

    /// Collapse later enqueues with the same key into this one.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(EntryId),
    /// Uniqueness collision; an equivalent entry already exists
    Duplicate,
}

impl EnqueueOutcome {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            EnqueueOutcome::Enqueued(id) => Some(*id),
            EnqueueOutcome::Duplicate => None,
        }
    }
}

/// Result of `schedule_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled {
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered,
}

/// Entry counts per status for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl OutboxStats {
    pub fn record(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Sending => self.sending += 1,
            OutboxStatus::Sent => self.sent += 1,
            OutboxStatus::Failed => self.failed += 1,
            OutboxStatus::DeadLetter => self.dead_letter += 1,
        }
    }
}

/// Cap an error message at [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}

/// Smallest delay a retry may use so `available_at` moves past the failure.
pub fn retry_delay(delay: std::time::Duration) -> chrono::Duration {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
    delay.max(chrono::Duration::milliseconds(1))
}
