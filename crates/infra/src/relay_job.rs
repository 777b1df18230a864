//! Outbox relay exposed as a scheduled job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use steward_outbox::{DispatchHandler, OutboxRelay, OutboxStore};
use steward_scheduler::{ScheduleResolver, ScheduledJobPort, TriggerDescriptor};
use tracing::info;

/// One poll of an [`OutboxRelay`] per scheduler firing.
///
/// The trigger is resolved through the policy resolver on every call, so the
/// relay's cadence (or whether it runs at all) follows the live policy.
pub struct OutboxRelayJob<S, H> {
    job_code: String,
    resolver: ScheduleResolver,
    relay: OutboxRelay<S, H>,
}

impl<S, H> OutboxRelayJob<S, H>
where
    S: OutboxStore + 'static,
    H: DispatchHandler,
{
    pub fn new(
        job_code: impl Into<String>,
        resolver: ScheduleResolver,
        relay: OutboxRelay<S, H>,
    ) -> Self {
        Self {
            job_code: job_code.into(),
            resolver,
            relay,
        }
    }

    pub fn relay(&self) -> &OutboxRelay<S, H> {
        &self.relay
    }
}

#[async_trait]
impl<S, H> ScheduledJobPort for OutboxRelayJob<S, H>
where
    S: OutboxStore + 'static,
    H: DispatchHandler,
{
    fn job_id(&self) -> &str {
        &self.job_code
    }

    fn trigger(&self) -> Option<TriggerDescriptor> {
        self.resolver.resolve(&self.job_code)
    }

    async fn run_once(&self, _now: DateTime<Utc>) -> anyhow::Result<()> {
        let report = self.relay.poll_once().await?;
        if report.claimed > 0 || report.reclaimed > 0 {
            info!(
                job_id = %self.job_code,
                queue = %self.relay.config().queue,
                claimed = report.claimed,
                sent = report.sent,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                lease_lost = report.lease_lost,
                "relay job finished"
            );
        }
        if report.store_errors > 0 {
            anyhow::bail!(
                "{} outcome(s) could not be recorded for queue {}",
                report.store_errors,
                self.relay.config().queue
            );
        }
        Ok(())
    }
}
