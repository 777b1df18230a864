//! Trigger descriptors and next-execution computation.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::SchedulerError;
use crate::port::ScheduledJobPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// Six-field cron (`sec min hour day-of-month month day-of-week`)
    Cron { expression: String },
    /// Run again `interval` after the previous run completed
    FixedDelay { interval: Duration },
}

/// Schedule of one job, computed fresh on every query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDescriptor {
    pub enabled: bool,
    pub kind: TriggerKind,
    pub initial_delay: Duration,
    pub timezone: Tz,
}

/// Execution history the scheduler keeps for each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerContext {
    pub registered_at: DateTime<Utc>,
    pub last_scheduled: Option<DateTime<Utc>>,
    pub last_completion: Option<DateTime<Utc>>,
}

impl TriggerContext {
    pub fn new(registered_at: DateTime<Utc>) -> Self {
        Self {
            registered_at,
            last_scheduled: None,
            last_completion: None,
        }
    }
}

impl TriggerDescriptor {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            enabled: true,
            kind: TriggerKind::Cron {
                expression: expression.into(),
            },
            initial_delay: Duration::ZERO,
            timezone: Tz::UTC,
        }
    }

    pub fn fixed_delay(interval: Duration) -> Self {
        Self {
            enabled: true,
            kind: TriggerKind::FixedDelay { interval },
            initial_delay: Duration::ZERO,
            timezone: Tz::UTC,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Next firing time given the job's history; `None` when disabled.
    pub fn next_after(
        &self,
        ctx: &TriggerContext,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        if !self.enabled {
            return Ok(None);
        }

        let first_run = ctx.registered_at + to_chrono(self.initial_delay);
        match &self.kind {
            TriggerKind::Cron { expression } => {
                let schedule = parse_cron(expression)?;
                let base = match (ctx.last_completion, ctx.last_scheduled) {
                    (Some(completed), Some(scheduled)) => completed.max(scheduled),
                    (Some(completed), None) => completed,
                    (None, Some(scheduled)) => scheduled,
                    (None, None) => first_run,
                };
                Ok(schedule
                    .after(&base.with_timezone(&self.timezone))
                    .next()
                    .map(|at| at.with_timezone(&Utc)))
            }
            TriggerKind::FixedDelay { interval } => Ok(Some(match ctx.last_completion {
                Some(completed) => completed + to_chrono(*interval),
                None => first_run,
            })),
        }
    }
}

pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule, SchedulerError> {
    cron::Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Trigger bound to a port, re-resolving the port's descriptor per query.
#[derive(Clone)]
pub struct DynamicTrigger {
    port: Arc<dyn ScheduledJobPort>,
}

impl DynamicTrigger {
    pub fn new(port: Arc<dyn ScheduledJobPort>) -> Self {
        Self { port }
    }

    /// `None` pauses the job without unregistering it.
    pub fn next_execution(&self, ctx: &TriggerContext) -> Option<DateTime<Utc>> {
        let descriptor = self.port.trigger().filter(|d| d.enabled)?;
        match descriptor.next_after(ctx) {
            Ok(next) => next,
            Err(e) => {
                warn!(job_id = self.port.job_id(), error = %e, "unusable trigger, job paused");
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicTrigger")
            .field("job_id", &self.port.job_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, h, m, s).unwrap()
    }

    struct SwitchablePort {
        descriptor: Mutex<Option<TriggerDescriptor>>,
    }

    #[async_trait]
    impl ScheduledJobPort for SwitchablePort {
        fn job_id(&self) -> &str {
            "switchable"
        }

        fn trigger(&self) -> Option<TriggerDescriptor> {
            self.descriptor.lock().unwrap().clone()
        }

        async fn run_once(&self, _now: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cron_fires_at_next_matching_second() {
        let ctx = TriggerContext::new(at(10, 2, 30));
        let every_five_minutes = TriggerDescriptor::cron("0 */5 * * * *");
        assert_eq!(every_five_minutes.next_after(&ctx).unwrap(), Some(at(10, 5, 0)));
    }

    #[test]
    fn cron_continues_from_last_completion() {
        let ctx = TriggerContext {
            registered_at: at(9, 0, 0),
            last_scheduled: Some(at(10, 5, 0)),
            last_completion: Some(at(10, 5, 3)),
        };
        let trigger = TriggerDescriptor::cron("0 */5 * * * *");
        assert_eq!(trigger.next_after(&ctx).unwrap(), Some(at(10, 10, 0)));
    }

    #[test]
    fn cron_is_evaluated_in_its_timezone() {
        // 09:00 in Seoul is 00:00 UTC.
        let ctx = TriggerContext::new(at(20, 0, 0));
        let trigger =
            TriggerDescriptor::cron("0 0 9 * * *").with_timezone(chrono_tz::Asia::Seoul);
        assert_eq!(
            trigger.next_after(&ctx).unwrap(),
            Some(Utc.with_ymd_and_hms(2026, 4, 11, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn fixed_delay_uses_initial_delay_then_interval() {
        let trigger = TriggerDescriptor::fixed_delay(Duration::from_secs(30))
            .with_initial_delay(Duration::from_secs(5));

        let mut ctx = TriggerContext::new(at(8, 0, 0));
        assert_eq!(trigger.next_after(&ctx).unwrap(), Some(at(8, 0, 5)));

        ctx.last_scheduled = Some(at(8, 0, 5));
        ctx.last_completion = Some(at(8, 0, 7));
        assert_eq!(trigger.next_after(&ctx).unwrap(), Some(at(8, 0, 37)));
    }

    #[test]
    fn invalid_cron_is_an_error() {
        let ctx = TriggerContext::new(at(8, 0, 0));
        let err = TriggerDescriptor::cron("every minute").next_after(&ctx).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[test]
    fn dynamic_trigger_follows_port_changes() {
        let port = Arc::new(SwitchablePort {
            descriptor: Mutex::new(Some(TriggerDescriptor::cron("0 0 * * * *"))),
        });
        let trigger = DynamicTrigger::new(port.clone());
        let ctx = TriggerContext::new(at(10, 2, 0));

        assert_eq!(trigger.next_execution(&ctx), Some(at(11, 0, 0)));

        *port.descriptor.lock().unwrap() = Some(TriggerDescriptor::cron("0 */5 * * * *"));
        assert_eq!(trigger.next_execution(&ctx), Some(at(10, 5, 0)));

        *port.descriptor.lock().unwrap() =
            Some(TriggerDescriptor::cron("0 */5 * * * *").with_enabled(false));
        assert_eq!(trigger.next_execution(&ctx), None);

        *port.descriptor.lock().unwrap() = None;
        assert_eq!(trigger.next_execution(&ctx), None);

        *port.descriptor.lock().unwrap() = Some(TriggerDescriptor::cron("bogus"));
        assert_eq!(trigger.next_execution(&ctx), None);
    }

    proptest! {
        /// Property: a cron trigger always fires strictly after its base time
        /// and no later than one period after it.
        #[test]
        fn cron_next_is_within_one_period(offset_secs in 0i64..86_400, minutes in 1u32..60) {
            let base = at(0, 0, 0) + chrono::Duration::seconds(offset_secs);
            let ctx = TriggerContext {
                registered_at: at(0, 0, 0),
                last_scheduled: None,
                last_completion: Some(base),
            };
            let trigger = TriggerDescriptor::cron(format!("0 */{minutes} * * * *"));
            let next = trigger.next_after(&ctx).unwrap().unwrap();

            prop_assert!(next > base);
            prop_assert!(next - base <= chrono::Duration::hours(1));
        }

        /// Property: a fixed-delay trigger fires exactly one interval after completion.
        #[test]
        fn fixed_delay_next_is_completion_plus_interval(offset_secs in 0i64..86_400, interval_ms in 0u64..3_600_000) {
            let completed = at(0, 0, 0) + chrono::Duration::seconds(offset_secs);
            let ctx = TriggerContext {
                registered_at: at(0, 0, 0),
                last_scheduled: Some(completed),
                last_completion: Some(completed),
            };
            let trigger = TriggerDescriptor::fixed_delay(Duration::from_millis(interval_ms));
            let next = trigger.next_after(&ctx).unwrap().unwrap();

            prop_assert_eq!(next - completed, chrono::Duration::milliseconds(interval_ms as i64));
        }
    }
}
