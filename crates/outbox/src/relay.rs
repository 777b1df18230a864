//! Relay: claim a batch, dispatch each entry, record the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use steward_core::WorkerId;

use crate::error::OutboxError;
use crate::handler::{DispatchError, DispatchHandler};
use crate::retry::RetryPolicy;
use crate::store::OutboxStore;
use crate::types::{OutboxEntry, RetryOutcome};

/// Relay configuration for one queue.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub queue: String,
    /// Lock owner recorded on claimed entries
    pub worker_id: WorkerId,
    /// Maximum entries claimed per poll
    pub batch_size: usize,
    /// Maximum handlers in flight at once
    pub max_concurrency: usize,
    /// Reclaim `Sending` entries locked for longer than this; `None` disables
    pub lease_timeout: Option<Duration>,
    /// Longest a single handler call may run before it counts as a
    /// retryable failure
    pub dispatch_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl RelayConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            worker_id: WorkerId::generate(&queue),
            queue,
            batch_size: 50,
            max_concurrency: 8,
            lease_timeout: Some(Duration::from_secs(300)),
            dispatch_timeout: Duration::from_secs(120),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_lease_timeout(mut self, lease: Option<Duration>) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Handler deadline actually applied: `dispatch_timeout`, capped at half
    /// the lease so a handler is abandoned before its entry can be reclaimed.
    pub fn handler_deadline(&self) -> Duration {
        let deadline = match self.lease_timeout {
            Some(lease) => self.dispatch_timeout.min(lease / 2),
            None => self.dispatch_timeout,
        };
        deadline.max(Duration::from_millis(1))
    }
}

/// What happened to one dispatched entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Retried,
    DeadLettered,
    Failed,
}

/// Summary of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub failed: usize,
    /// Entries reclaimed and re-claimed by another worker mid-dispatch
    pub lease_lost: usize,
    /// Outcomes that could not be written back to the store
    pub store_errors: usize,
}

impl RelayReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent => self.sent += 1,
            DispatchOutcome::Retried => self.retried += 1,
            DispatchOutcome::DeadLettered => self.dead_lettered += 1,
            DispatchOutcome::Failed => self.failed += 1,
        }
    }
}

/// Outbox relay for one queue.
///
/// Each `poll_once` claims a batch under this relay's worker id and runs the
/// handler for every entry on a bounded set of tokio tasks. Several relays
/// (in one process or many) may poll the same queue; the store's atomic
/// claim keeps them from processing an entry twice.
pub struct OutboxRelay<S, H> {
    store: Arc<S>,
    handler: Arc<H>,
    config: RelayConfig,
    permits: Arc<Semaphore>,
}

impl<S, H> OutboxRelay<S, H>
where
    S: OutboxStore + 'static,
    H: DispatchHandler,
{
    pub fn new(store: S, handler: H, config: RelayConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            store: Arc::new(store),
            handler: Arc::new(handler),
            config,
            permits,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one reclaim + claim + dispatch cycle.
    pub async fn poll_once(&self) -> Result<RelayReport, OutboxError> {
        let queue = self.config.queue.as_str();
        let mut report = RelayReport::default();

        if let Some(lease) = self.config.lease_timeout {
            report.reclaimed = self.store.reclaim_expired(queue, lease).await?;
            if report.reclaimed > 0 {
                warn!(queue, reclaimed = report.reclaimed, "reclaimed expired outbox leases");
            }
        }

        let claimed = self
            .store
            .claim_pending(queue, self.config.batch_size, &self.config.worker_id)
            .await?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(report);
        }

        debug!(
            queue,
            worker = %self.config.worker_id,
            claimed = report.claimed,
            "claimed outbox entries"
        );

        let mut tasks = JoinSet::new();
        for entry in claimed {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| OutboxError::storage("dispatch pool closed"))?;
            let store = self.store.clone();
            let handler = self.handler.clone();
            let policy = self.config.retry_policy.clone();
            let worker = self.config.worker_id.clone();
            let deadline = self.config.handler_deadline();

            tasks.spawn(async move {
                let _permit = permit;
                let id = entry.id;
                let ctx = DispatchContext {
                    worker: &worker,
                    policy: &policy,
                    deadline,
                };
                (id, dispatch_entry(&*store, handler, ctx, entry).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(outcome),
                Ok((id, Err(OutboxError::LeaseLost { .. }))) => {
                    warn!(
                        queue,
                        entry_id = %id,
                        worker = %self.config.worker_id,
                        "lease lost before outcome was recorded, entry belongs to another worker"
                    );
                    report.lease_lost += 1;
                }
                Ok((id, Err(e))) => {
                    error!(queue, entry_id = %id, error = %e, "failed to record dispatch outcome");
                    report.store_errors += 1;
                }
                Err(e) => {
                    error!(queue, error = %e, "dispatch task aborted");
                    report.store_errors += 1;
                }
            }
        }

        info!(
            queue,
            claimed = report.claimed,
            sent = report.sent,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            failed = report.failed,
            "outbox relay pass finished"
        );
        Ok(report)
    }
}

struct DispatchContext<'a> {
    worker: &'a WorkerId,
    policy: &'a RetryPolicy,
    deadline: Duration,
}

async fn dispatch_entry<S, H>(
    store: &S,
    handler: Arc<H>,
    ctx: DispatchContext<'_>,
    entry: OutboxEntry,
) -> Result<DispatchOutcome, OutboxError>
where
    S: OutboxStore,
    H: DispatchHandler,
{
    let DispatchContext {
        worker,
        policy,
        deadline,
    } = ctx;

    let payload: H::Payload = match serde_json::from_value(entry.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            let msg = format!("payload decode failed: {e}");
            warn!(queue = %entry.queue, entry_id = %entry.id, error = %msg, "outbox entry failed");
            store.mark_failed(entry.id, worker, &msg).await?;
            return Ok(DispatchOutcome::Failed);
        }
    };

    // Separate task so a panicking handler becomes a retryable failure.
    let job_type = entry.job_type.clone();
    let mut call = tokio::spawn(async move { handler.dispatch(&job_type, payload).await });
    let result = match tokio::time::timeout(deadline, &mut call).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(DispatchError::retryable(format!("handler panicked: {e}"))),
        Err(_) => {
            call.abort();
            Err(DispatchError::retryable(format!(
                "handler timed out after {}ms",
                deadline.as_millis()
            )))
        }
    };

    match result {
        Ok(()) => {
            store.mark_completed(entry.id, worker).await?;
            debug!(queue = %entry.queue, entry_id = %entry.id, "outbox entry sent");
            Ok(DispatchOutcome::Sent)
        }
        Err(DispatchError::Permanent(msg)) => {
            warn!(queue = %entry.queue, entry_id = %entry.id, error = %msg, "outbox entry failed");
            store.mark_failed(entry.id, worker, &msg).await?;
            Ok(DispatchOutcome::Failed)
        }
        Err(DispatchError::Retryable(msg)) => {
            if !policy.should_retry(entry.retry_count) {
                warn!(
                    queue = %entry.queue,
                    entry_id = %entry.id,
                    retry_count = entry.retry_count,
                    error = %msg,
                    "outbox entry dead-lettered"
                );
                store.mark_dead_letter(entry.id, worker, &msg).await?;
                return Ok(DispatchOutcome::DeadLettered);
            }

            let delay = policy.delay_for_attempt(entry.retry_count + 1);
            match store.schedule_retry(entry.id, worker, delay, &msg).await? {
                RetryOutcome::Rescheduled {
                    retry_count,
                    available_at,
                } => {
                    debug!(
                        queue = %entry.queue,
                        entry_id = %entry.id,
                        retry_count,
                        %available_at,
                        error = %msg,
                        "outbox entry rescheduled"
                    );
                    Ok(DispatchOutcome::Retried)
                }
                RetryOutcome::DeadLettered => {
                    warn!(
                        queue = %entry.queue,
                        entry_id = %entry.id,
                        error = %msg,
                        "outbox entry dead-lettered"
                    );
                    Ok(DispatchOutcome::DeadLettered)
                }
            }
        }
    }
}
