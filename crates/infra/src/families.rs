//! Job families served by the relay process.
//!
//! Each family is one outbox queue with its own relay, retry policy, and
//! policy-tunable schedule. The payload types are the contracts between the
//! enqueuing domain and the downstream handler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_outbox::RetryPolicy;
use steward_scheduler::{BatchJobSchedule, ScheduleResolver};

pub const INGESTION_QUEUE: &str = "ingestion";
pub const FILE_AUDIT_QUEUE: &str = "file_audit";
pub const DRAFT_AUDIT_QUEUE: &str = "draft_audit";

#[derive(Debug, Clone, PartialEq)]
pub struct JobFamily {
    pub queue: &'static str,
    /// Key for the policy lookup of this family's schedule
    pub job_code: &'static str,
    pub default_schedule: BatchJobSchedule,
    pub retry_policy: RetryPolicy,
}

pub fn ingestion() -> JobFamily {
    JobFamily {
        queue: INGESTION_QUEUE,
        job_code: "ingestion-outbox-relay",
        default_schedule: BatchJobSchedule::fixed_delay(Duration::from_secs(30))
            .with_initial_delay(Duration::from_secs(10)),
        retry_policy: RetryPolicy::exponential(
            steward_outbox::MAX_RETRY,
            Duration::from_secs(30),
            Duration::from_secs(600),
        ),
    }
}

pub fn file_audit() -> JobFamily {
    JobFamily {
        queue: FILE_AUDIT_QUEUE,
        job_code: "file-audit-outbox-relay",
        default_schedule: BatchJobSchedule::fixed_delay(Duration::from_secs(10)),
        retry_policy: RetryPolicy::exponential(
            steward_outbox::MAX_RETRY,
            Duration::from_secs(5),
            Duration::from_secs(300),
        ),
    }
}

pub fn draft_audit() -> JobFamily {
    JobFamily {
        job_code: "draft-audit-outbox-relay",
        queue: DRAFT_AUDIT_QUEUE,
        ..file_audit()
    }
}

pub fn all() -> Vec<JobFamily> {
    vec![ingestion(), file_audit(), draft_audit()]
}

/// Resolver seeded with every family's static default.
pub fn with_defaults(resolver: ScheduleResolver) -> ScheduleResolver {
    all()
        .into_iter()
        .fold(resolver, |r, family| r.with_default(family.job_code, family.default_schedule))
}

/// Ingestion trigger carried by the `ingestion` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRequest {
    pub source_id: String,
    pub file_path: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Audit record carried by the `file_audit` and `draft_audit` queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub actor: String,
    pub resource_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}
