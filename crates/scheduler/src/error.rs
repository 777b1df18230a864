//! Scheduler error model.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("schedule for {0} has neither a cron expression nor a fixed delay")]
    MissingSchedule(String),

    #[error("job already registered: {0}")]
    DuplicateJob(String),
}
