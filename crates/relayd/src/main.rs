//! Outbox relay process.
//!
//! Runs one relay per job family under a single policy-driven scheduler and
//! stops on Ctrl-C after in-flight polls drain.

mod forwarders;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use steward_infra::families::{self, JobFamily};
use steward_infra::{FilePolicySettings, OutboxRelayJob, PgOutboxStore, RelayConfig};
use steward_outbox::{DispatchHandler, OutboxRelay};
use steward_scheduler::{
    DelegatingJobScheduler, NoPolicySettings, PolicySettingsProvider, ScheduleResolver,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::forwarders::{AuditLogForwarder, IngestionForwarder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    steward_observability::init(config.log_format);

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let store = Arc::new(PgOutboxStore::new(pool).with_max_retry(config.max_retry));
    store.migrate().await.context("failed to apply outbox schema")?;

    let provider: Arc<dyn PolicySettingsProvider> = match &config.policy_file {
        Some(path) => {
            info!(path = %path.display(), "using policy file for batch job schedules");
            Arc::new(FilePolicySettings::new(path))
        }
        None => Arc::new(NoPolicySettings),
    };
    let resolver = families::with_defaults(ScheduleResolver::new(provider));

    let scheduler = Arc::new(DelegatingJobScheduler::new(config.scheduler_config()));
    register(
        &scheduler,
        &config,
        &resolver,
        &store,
        families::ingestion(),
        IngestionForwarder,
    )?;
    for family in [families::file_audit(), families::draft_audit()] {
        let forwarder = AuditLogForwarder::new(family.queue);
        register(&scheduler, &config, &resolver, &store, family, forwarder)?;
    }

    let shutdown = CancellationToken::new();
    let running = scheduler.clone().start(shutdown.clone());
    info!(jobs = ?scheduler.job_ids(), "steward relay started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown.cancel();
    running.await.context("scheduler task failed")?;

    Ok(())
}

fn register<H>(
    scheduler: &DelegatingJobScheduler,
    config: &RelayConfig,
    resolver: &ScheduleResolver,
    store: &Arc<PgOutboxStore>,
    family: JobFamily,
    handler: H,
) -> anyhow::Result<()>
where
    H: DispatchHandler,
{
    let relay = OutboxRelay::new(store.clone(), handler, config.relay_config(&family));
    let job = OutboxRelayJob::new(family.job_code, resolver.clone(), relay);
    scheduler
        .register(Arc::new(job))
        .with_context(|| format!("failed to register {}", family.job_code))?;
    Ok(())
}
