//! Capability implemented by every periodic job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::trigger::TriggerDescriptor;

#[async_trait]
pub trait ScheduledJobPort: Send + Sync + 'static {
    /// Stable code, also the key used for policy lookup.
    fn job_id(&self) -> &str;

    /// Current schedule. `None` (or a disabled descriptor) pauses the job.
    ///
    /// Called on every scheduling decision; implementations must not cache.
    fn trigger(&self) -> Option<TriggerDescriptor>;

    async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<()>;
}
