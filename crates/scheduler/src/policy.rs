//! Policy-backed schedule resolution.
//!
//! The effective schedule for a job code is the live policy value when the
//! provider has one, otherwise the static default registered with the
//! resolver. Nothing is cached: each call goes back to the provider.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SchedulerError;
use crate::trigger::{TriggerDescriptor, TriggerKind, parse_cron};

fn default_enabled() -> bool {
    true
}

/// Schedule shape as stored in the policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJobSchedule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl BatchJobSchedule {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            enabled: true,
            cron: Some(expression.into()),
            fixed_delay_ms: None,
            initial_delay_ms: None,
            timezone: None,
        }
    }

    pub fn fixed_delay(interval: Duration) -> Self {
        Self {
            enabled: true,
            cron: None,
            fixed_delay_ms: Some(interval.as_millis().min(u64::MAX as u128) as u64),
            initial_delay_ms: None,
            timezone: None,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = Some(delay.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Convert to a trigger. Cron wins when both cron and fixed delay are set.
    pub fn to_trigger(&self, job_code: &str) -> Result<TriggerDescriptor, SchedulerError> {
        let kind = match (&self.cron, self.fixed_delay_ms) {
            (Some(expression), _) => {
                parse_cron(expression)?;
                TriggerKind::Cron {
                    expression: expression.clone(),
                }
            }
            (None, Some(ms)) => TriggerKind::FixedDelay {
                interval: Duration::from_millis(ms),
            },
            (None, None) => return Err(SchedulerError::MissingSchedule(job_code.to_string())),
        };

        let timezone = match self.timezone.as_deref() {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| SchedulerError::InvalidTimezone(format!("{name}: {e}")))?,
            None => Tz::UTC,
        };

        Ok(TriggerDescriptor {
            enabled: self.enabled,
            kind,
            initial_delay: Duration::from_millis(self.initial_delay_ms.unwrap_or(0)),
            timezone,
        })
    }
}

/// Read access to the live policy settings.
pub trait PolicySettingsProvider: Send + Sync {
    fn batch_job_schedule(&self, job_code: &str) -> Option<BatchJobSchedule>;
}

/// Provider with no live settings; every job falls back to its default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPolicySettings;

impl PolicySettingsProvider for NoPolicySettings {
    fn batch_job_schedule(&self, _job_code: &str) -> Option<BatchJobSchedule> {
        None
    }
}

/// Mutable in-process settings, used by tests and embedded setups.
#[derive(Debug, Default)]
pub struct InMemoryPolicySettings {
    schedules: RwLock<HashMap<String, BatchJobSchedule>>,
}

impl InMemoryPolicySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, job_code: impl Into<String>, schedule: BatchJobSchedule) {
        self.schedules
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_code.into(), schedule);
    }

    pub fn remove(&self, job_code: &str) -> Option<BatchJobSchedule> {
        self.schedules
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(job_code)
    }
}

impl PolicySettingsProvider for InMemoryPolicySettings {
    fn batch_job_schedule(&self, job_code: &str) -> Option<BatchJobSchedule> {
        self.schedules
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_code)
            .cloned()
    }
}

impl<P: PolicySettingsProvider + ?Sized> PolicySettingsProvider for Arc<P> {
    fn batch_job_schedule(&self, job_code: &str) -> Option<BatchJobSchedule> {
        (**self).batch_job_schedule(job_code)
    }
}

#[derive(Clone)]
pub struct ScheduleResolver {
    provider: Arc<dyn PolicySettingsProvider>,
    defaults: HashMap<String, BatchJobSchedule>,
}

impl ScheduleResolver {
    pub fn new(provider: Arc<dyn PolicySettingsProvider>) -> Self {
        Self {
            provider,
            defaults: HashMap::new(),
        }
    }

    pub fn with_default(mut self, job_code: impl Into<String>, schedule: BatchJobSchedule) -> Self {
        self.defaults.insert(job_code.into(), schedule);
        self
    }

    /// Live value if present, else the static default.
    pub fn effective_schedule(&self, job_code: &str) -> Option<BatchJobSchedule> {
        self.provider
            .batch_job_schedule(job_code)
            .or_else(|| self.defaults.get(job_code).cloned())
    }

    /// Trigger for `job_code`, or `None` when it has no usable schedule.
    pub fn resolve(&self, job_code: &str) -> Option<TriggerDescriptor> {
        let schedule = self.effective_schedule(job_code)?;
        match schedule.to_trigger(job_code) {
            Ok(trigger) => Some(trigger),
            Err(e) => {
                warn!(job_code, error = %e, "ignoring unusable batch job schedule");
                None
            }
        }
    }
}

impl std::fmt::Debug for ScheduleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleResolver")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(settings: Arc<InMemoryPolicySettings>) -> ScheduleResolver {
        ScheduleResolver::new(settings)
            .with_default("file_audit", BatchJobSchedule::fixed_delay(Duration::from_secs(5)))
    }

    #[test]
    fn deserializes_camel_case_policy_value() {
        let json = r#"{"cron":"0 */10 * * * *","initialDelayMs":2000,"timezone":"Asia/Seoul"}"#;
        let schedule: BatchJobSchedule = serde_json::from_str(json).unwrap();

        assert!(schedule.enabled);
        assert_eq!(schedule.cron.as_deref(), Some("0 */10 * * * *"));
        assert_eq!(schedule.initial_delay_ms, Some(2000));

        let trigger = schedule.to_trigger("ingestion").unwrap();
        assert_eq!(trigger.timezone, chrono_tz::Asia::Seoul);
        assert_eq!(trigger.initial_delay, Duration::from_secs(2));
    }

    #[test]
    fn cron_wins_over_fixed_delay() {
        let schedule = BatchJobSchedule {
            fixed_delay_ms: Some(1000),
            ..BatchJobSchedule::cron("0 * * * * *")
        };
        let trigger = schedule.to_trigger("ingestion").unwrap();
        assert!(matches!(trigger.kind, TriggerKind::Cron { .. }));
    }

    #[test]
    fn schedule_without_trigger_is_rejected() {
        let schedule = BatchJobSchedule {
            cron: None,
            ..BatchJobSchedule::cron("unused")
        };
        assert_eq!(
            schedule.to_trigger("ingestion"),
            Err(SchedulerError::MissingSchedule("ingestion".into()))
        );
    }

    #[test]
    fn bad_timezone_and_cron_are_rejected() {
        let tz = BatchJobSchedule::cron("0 * * * * *").with_timezone("Mars/Olympus");
        assert!(matches!(
            tz.to_trigger("x"),
            Err(SchedulerError::InvalidTimezone(_))
        ));

        let cron = BatchJobSchedule::cron("61 * * * * *");
        assert!(matches!(cron.to_trigger("x"), Err(SchedulerError::InvalidCron { .. })));
    }

    #[test]
    fn live_value_overrides_default_without_caching() {
        let settings = Arc::new(InMemoryPolicySettings::new());
        let resolver = resolver(settings.clone());

        let initial = resolver.resolve("file_audit").unwrap();
        assert_eq!(
            initial.kind,
            TriggerKind::FixedDelay {
                interval: Duration::from_secs(5)
            }
        );

        settings.set("file_audit", BatchJobSchedule::cron("0 0 * * * *"));
        let live = resolver.resolve("file_audit").unwrap();
        assert!(matches!(live.kind, TriggerKind::Cron { .. }));

        settings.set(
            "file_audit",
            BatchJobSchedule::cron("0 0 * * * *").with_enabled(false),
        );
        assert!(!resolver.resolve("file_audit").unwrap().enabled);

        settings.remove("file_audit");
        assert_eq!(resolver.resolve("file_audit"), Some(initial));
    }

    #[test]
    fn unknown_job_resolves_to_none() {
        let resolver = ScheduleResolver::new(Arc::new(NoPolicySettings));
        assert_eq!(resolver.resolve("nobody"), None);
    }

    #[test]
    fn invalid_live_value_pauses_the_job() {
        let settings = Arc::new(InMemoryPolicySettings::new());
        let resolver = resolver(settings.clone());

        settings.set("file_audit", BatchJobSchedule::cron("not a cron"));
        assert_eq!(resolver.resolve("file_audit"), None);
    }
}
