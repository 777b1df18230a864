//! Postgres adapters.

mod store;

pub use store::{PgOutboxStore, OUTBOX_MIGRATION};
