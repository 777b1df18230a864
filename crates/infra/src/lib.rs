//! Infrastructure layer: Postgres outbox store, configuration, job wiring.

pub mod config;
pub mod families;
pub mod policy_file;
pub mod postgres;
pub mod relay_job;

pub use config::{ConfigError, RelayConfig};
pub use policy_file::FilePolicySettings;
pub use postgres::{PgOutboxStore, OUTBOX_MIGRATION};
pub use relay_job::OutboxRelayJob;
