//! Delegating job scheduler.
//!
//! Holds every registered [`ScheduledJobPort`] and, on each tick, asks the
//! job's [`DynamicTrigger`] whether it is due. Disabled jobs stay registered
//! and simply never come due until their policy re-enables them.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use steward_core::{Clock, SystemClock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::port::ScheduledJobPort;
use crate::trigger::{DynamicTrigger, TriggerContext};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due-ness is re-evaluated
    pub tick: Duration,
    /// Grace period for in-flight runs on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Execution history and counters of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub registered_at: DateTime<Utc>,
    pub last_scheduled: Option<DateTime<Utc>>,
    pub last_completion: Option<DateTime<Utc>>,
    pub running: bool,
    pub runs: u64,
    pub failures: u64,
}

impl JobState {
    fn new(registered_at: DateTime<Utc>) -> Self {
        Self {
            registered_at,
            last_scheduled: None,
            last_completion: None,
            running: false,
            runs: 0,
            failures: 0,
        }
    }

    fn context(&self) -> TriggerContext {
        TriggerContext {
            registered_at: self.registered_at,
            last_scheduled: self.last_scheduled,
            last_completion: self.last_completion,
        }
    }
}

struct JobSlot {
    port: Arc<dyn ScheduledJobPort>,
    trigger: DynamicTrigger,
    state: Arc<Mutex<JobState>>,
}

fn lock(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct DelegatingJobScheduler {
    jobs: RwLock<Vec<JobSlot>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl DelegatingJobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
            clock,
            config,
        }
    }

    /// Register a job. Jobs whose trigger is currently disabled are still
    /// registered so that a later policy change can activate them.
    pub fn register(&self, port: Arc<dyn ScheduledJobPort>) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        let job_id = port.job_id().to_string();
        if jobs.iter().any(|slot| slot.port.job_id() == job_id) {
            return Err(SchedulerError::DuplicateJob(job_id));
        }

        let state = JobState::new(self.clock.now());
        let trigger = DynamicTrigger::new(port.clone());
        let next = trigger.next_execution(&state.context());
        info!(
            job_id = %job_id,
            active = next.is_some(),
            next_execution = ?next,
            "registered scheduled job"
        );

        jobs.push(JobSlot {
            port,
            trigger,
            state: Arc::new(Mutex::new(state)),
        });
        Ok(())
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|slot| slot.port.job_id().to_string())
            .collect()
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|slot| slot.port.job_id() == job_id)
            .map(|slot| lock(&slot.state).clone())
    }

    /// Next execution time as the trigger sees it right now.
    pub fn next_execution(&self, job_id: &str) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.read().unwrap_or_else(|p| p.into_inner());
        let slot = jobs.iter().find(|slot| slot.port.job_id() == job_id)?;
        let ctx = lock(&slot.state).context();
        slot.trigger.next_execution(&ctx)
    }

    /// Start every job that is due at `now` and not already running.
    ///
    /// Must be called within a Tokio runtime. The returned handles complete
    /// once the corresponding run has finished and its state is recorded.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let jobs = self.jobs.read().unwrap_or_else(|p| p.into_inner());
        let mut started = Vec::new();

        for slot in jobs.iter() {
            let ctx = {
                let state = lock(&slot.state);
                if state.running {
                    continue;
                }
                state.context()
            };

            let Some(due) = slot.trigger.next_execution(&ctx) else {
                continue;
            };
            if due > now {
                continue;
            }

            {
                let mut state = lock(&slot.state);
                state.running = true;
                state.last_scheduled = Some(due);
            }

            started.push(self.spawn_run(slot, now));
        }

        started
    }

    fn spawn_run(&self, slot: &JobSlot, now: DateTime<Utc>) -> JoinHandle<()> {
        let port = slot.port.clone();
        let state = slot.state.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let job_id = port.job_id().to_string();
            debug!(job_id = %job_id, "running scheduled job");

            // Inner task isolates panics so the slot is always released.
            let runner = port.clone();
            let result = tokio::spawn(async move { runner.run_once(now).await }).await;

            let mut state = lock(&state);
            state.running = false;
            state.last_completion = Some(clock.now());
            state.runs += 1;

            match result {
                Ok(Ok(())) => debug!(job_id = %job_id, "scheduled job completed"),
                Ok(Err(e)) => {
                    state.failures += 1;
                    let error = format!("{e:#}");
                    warn!(job_id = %job_id, error = %error, "scheduled job failed");
                }
                Err(join_error) => {
                    state.failures += 1;
                    error!(job_id = %job_id, error = %join_error, "scheduled job panicked");
                }
            }
        })
    }

    /// Drive the scheduler until `shutdown` is cancelled, then wait up to the
    /// configured grace period for in-flight runs.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                jobs = self.job_ids().len(),
                tick_ms = self.config.tick.as_millis() as u64,
                "job scheduler started"
            );

            let mut ticker = tokio::time::interval(self.config.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        in_flight.retain(|handle| !handle.is_finished());
                        in_flight.extend(self.tick(self.clock.now()));
                    }
                }
            }

            let pending = in_flight.len();
            let drain = async move {
                for handle in in_flight {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(self.config.shutdown_timeout, drain)
                .await
                .is_err()
            {
                warn!(pending, "shutdown timeout elapsed with jobs still running");
            }

            info!("job scheduler stopped");
        })
    }
}

impl std::fmt::Debug for DelegatingJobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingJobScheduler")
            .field("jobs", &self.job_ids())
            .field("config", &self.config)
            .finish()
    }
}
