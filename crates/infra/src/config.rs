//! Process configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use steward_core::WorkerId;
use steward_observability::LogFormat;
use steward_outbox::RetryPolicy;
use thiserror::Error;

use crate::families::JobFamily;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything `steward-relayd` needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Prefix for per-queue worker identities (`<worker_name>-<queue>-<uuid>`)
    pub worker_name: String,
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// `None` disables reclaiming of stuck `sending` entries
    pub lease_timeout: Option<Duration>,
    /// Per-handler deadline, capped at half the lease by the relay
    pub dispatch_timeout: Duration,
    pub max_retry: u32,
    pub scheduler_tick: Duration,
    pub shutdown_timeout: Duration,
    /// JSON document with live batch job schedules
    pub policy_file: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("STEWARD_DATABASE_URL")
            .or_else(|| get("DATABASE_URL"))
            .ok_or(ConfigError::Missing("STEWARD_DATABASE_URL"))?;

        let lease_secs: u64 = parse_or(&get, "STEWARD_RELAY_LEASE_SECS", 300)?;
        let batch_size: usize = parse_or(&get, "STEWARD_RELAY_BATCH_SIZE", 50)?;
        let max_concurrency: usize = parse_or(&get, "STEWARD_RELAY_MAX_CONCURRENCY", 8)?;
        let tick_ms: u64 = parse_or(&get, "STEWARD_SCHEDULER_TICK_MS", 1000)?;
        let dispatch_secs: u64 = parse_or(&get, "STEWARD_RELAY_DISPATCH_TIMEOUT_SECS", 120)?;

        require_positive("STEWARD_RELAY_BATCH_SIZE", batch_size)?;
        require_positive("STEWARD_RELAY_MAX_CONCURRENCY", max_concurrency)?;
        require_positive("STEWARD_SCHEDULER_TICK_MS", tick_ms as usize)?;
        require_positive("STEWARD_RELAY_DISPATCH_TIMEOUT_SECS", dispatch_secs as usize)?;

        Ok(Self {
            database_url,
            db_max_connections: parse_or(&get, "STEWARD_DB_MAX_CONNECTIONS", 10)?,
            worker_name: get("STEWARD_WORKER_NAME").unwrap_or_else(|| "relay".to_string()),
            batch_size,
            max_concurrency,
            lease_timeout: (lease_secs > 0).then(|| Duration::from_secs(lease_secs)),
            dispatch_timeout: Duration::from_secs(dispatch_secs),
            max_retry: parse_or(&get, "STEWARD_MAX_RETRY", steward_outbox::MAX_RETRY)?,
            scheduler_tick: Duration::from_millis(tick_ms),
            shutdown_timeout: Duration::from_secs(parse_or(
                &get,
                "STEWARD_SHUTDOWN_TIMEOUT_SECS",
                30,
            )?),
            policy_file: get("STEWARD_POLICY_FILE").map(PathBuf::from),
            log_format: parse_or(&get, "STEWARD_LOG_FORMAT", LogFormat::Json)?,
        })
    }

    /// Relay settings for one job family under this process's identity.
    pub fn relay_config(&self, family: &JobFamily) -> steward_outbox::RelayConfig {
        let worker = WorkerId::generate(&format!("{}-{}", self.worker_name, family.queue));
        steward_outbox::RelayConfig::new(family.queue)
            .with_worker_id(worker)
            .with_batch_size(self.batch_size)
            .with_max_concurrency(self.max_concurrency)
            .with_lease_timeout(self.lease_timeout)
            .with_dispatch_timeout(self.dispatch_timeout)
            .with_retry_policy(RetryPolicy {
                max_attempts: self.max_retry,
                ..family.retry_policy.clone()
            })
    }

    pub fn scheduler_config(&self) -> steward_scheduler::SchedulerConfig {
        steward_scheduler::SchedulerConfig {
            tick: self.scheduler_tick,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            })
        }
    }
}

fn require_positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
