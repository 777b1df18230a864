//! Transactional outbox with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Entries are written in the same transaction as the business change
//! - A relay claims ready entries atomically and hands them to a handler
//! - Retryable failures back off up to a fixed budget, then dead-letter
//! - Non-retryable failures are marked `Failed` and never retried
//!
//! ## Components
//!
//! - `OutboxEntry` / `OutboxStatus`: entry model and state machine
//! - `OutboxStore`: persistence boundary (in-memory here, Postgres in `steward-infra`)
//! - `RetryPolicy`: per-family backoff
//! - `DispatchHandler`: downstream side effect for one queue
//! - `OutboxRelay`: claim/dispatch loop

pub mod error;
pub mod handler;
pub mod relay;
pub mod retry;
pub mod store;
pub mod types;

pub use error::OutboxError;
pub use handler::{DispatchError, DispatchHandler, FnHandler};
pub use relay::{DispatchOutcome, OutboxRelay, RelayConfig, RelayReport};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{InMemoryOutboxStore, OutboxStore, LEASE_EXPIRED};
pub use types::{
    retry_delay, truncate_error, EnqueueOutcome, OutboxEntry, OutboxJob, OutboxStats, OutboxStatus,
    RetryOutcome, MAX_ERROR_LEN, MAX_RETRY,
};
