//! Outbox error model.

use thiserror::Error;

use steward_core::{EntryId, WorkerId};

use crate::types::OutboxStatus;

/// Outbox store / relay error.
///
/// Infrastructure failures only; a handler's own failure is a
/// [`DispatchError`](crate::handler::DispatchError) and never surfaces here.
#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    #[error("outbox entry not found: {0}")]
    NotFound(EntryId),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: EntryId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    /// The entry is `Sending` under another worker's claim; the caller's
    /// lease expired and the entry was reclaimed.
    #[error("lease lost on {id}: {worker} no longer holds the claim")]
    LeaseLost { id: EntryId, worker: WorkerId },

    #[error("payload error: {0}")]
    Payload(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl OutboxError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
