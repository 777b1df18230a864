//! Policy-driven dynamic scheduling.
//!
//! Jobs expose their schedule through [`ScheduledJobPort::trigger`], which is
//! asked again on every scheduling decision. A policy edit (new cron string,
//! enabled flag) is therefore picked up on the next tick without a restart.

pub mod error;
pub mod policy;
pub mod port;
pub mod registry;
pub mod trigger;

pub use error::SchedulerError;
pub use policy::{
    BatchJobSchedule, InMemoryPolicySettings, NoPolicySettings, PolicySettingsProvider,
    ScheduleResolver,
};
pub use port::ScheduledJobPort;
pub use registry::{DelegatingJobScheduler, JobState, SchedulerConfig};
pub use trigger::{DynamicTrigger, TriggerContext, TriggerDescriptor, TriggerKind};
