//! Policy settings backed by a JSON document on disk.
//!
//! The document maps job codes to schedules:
//!
//! ```json
//! {
//!   "file-audit-outbox-relay": { "cron": "0 */5 * * * *", "timezone": "Asia/Seoul" },
//!   "ingestion-outbox-relay": { "enabled": false, "fixedDelayMs": 30000 }
//! }
//! ```
//!
//! Every lookup stats the file and re-parses it only when its modification
//! time or size changed, so an operator edit takes effect on the next
//! scheduling decision. The stat is the only I/O left on the scheduler's tick
//! path; an unchanged file is served from the last parsed snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use steward_scheduler::{BatchJobSchedule, PolicySettingsProvider};
use tracing::{debug, warn};

/// File identity the current snapshot was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

#[derive(Debug, Default)]
struct Snapshot {
    stamp: Option<Stamp>,
    schedules: Option<HashMap<String, BatchJobSchedule>>,
}

#[derive(Debug)]
pub struct FilePolicySettings {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
    parses: AtomicUsize,
}

impl FilePolicySettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(Snapshot::default()),
            parses: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many times the document has been read and parsed.
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    fn stamp(&self) -> Option<Stamp> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Some(Stamp {
                modified: meta.modified().ok(),
                len: meta.len(),
            }),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "policy file unreadable");
                None
            }
        }
    }

    fn parse(&self) -> Option<HashMap<String, BatchJobSchedule>> {
        self.parses.fetch_add(1, Ordering::Relaxed);
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "policy file unreadable");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(schedules) => Some(schedules),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "policy file malformed");
                None
            }
        }
    }

    fn lookup(&self, job_code: &str) -> Option<BatchJobSchedule> {
        let stamp = self.stamp()?;

        {
            let snapshot = self.snapshot.read().unwrap_or_else(|p| p.into_inner());
            if snapshot.stamp == Some(stamp) {
                return snapshot.schedules.as_ref()?.get(job_code).cloned();
            }
        }

        let schedules = self.parse();
        debug!(path = %self.path.display(), ok = schedules.is_some(), "policy file reloaded");
        let mut snapshot = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        snapshot.stamp = Some(stamp);
        snapshot.schedules = schedules;
        snapshot.schedules.as_ref()?.get(job_code).cloned()
    }
}

impl PolicySettingsProvider for FilePolicySettings {
    fn batch_job_schedule(&self, job_code: &str) -> Option<BatchJobSchedule> {
        self.lookup(job_code)
    }
}
