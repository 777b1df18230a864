//! Outbox storage abstraction and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use steward_core::{Clock, EntryId, SystemClock, WorkerId};

use crate::error::OutboxError;
use crate::types::{
    retry_delay, truncate_error, EnqueueOutcome, OutboxEntry, OutboxJob, OutboxStats,
    OutboxStatus, RetryOutcome, MAX_RETRY,
};

/// Durable record of outbox entries.
///
/// The store is the only writer of entry state. Every method is one atomic
/// operation against the backing storage, so several relay workers (threads
/// or processes) can share a store without in-process locking.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a `Pending` entry. Uniqueness collisions yield `Duplicate`.
    async fn enqueue(&self, job: OutboxJob) -> Result<EnqueueOutcome, OutboxError>;

    /// Atomically claim up to `batch_size` ready entries of `queue`, oldest
    /// `available_at` first, moving them to `Sending` under `worker`.
    async fn claim_pending(
        &self,
        queue: &str,
        batch_size: usize,
        worker: &WorkerId,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;

    // Transitions out of `Sending` only apply while `worker` still holds the
    // claim. A reclaimed entry now owned by someone else yields `LeaseLost`.

    /// `Sending -> Sent`.
    async fn mark_completed(&self, id: EntryId, worker: &WorkerId) -> Result<(), OutboxError>;

    /// `Sending -> Pending` (delayed) or `Sending -> DeadLetter` once the
    /// retry budget is spent.
    async fn schedule_retry(
        &self,
        id: EntryId,
        worker: &WorkerId,
        delay: Duration,
        error: &str,
    ) -> Result<RetryOutcome, OutboxError>;

    /// `Sending -> DeadLetter`.
    async fn mark_dead_letter(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError>;

    /// `Sending -> Failed` for failures that will never succeed.
    async fn mark_failed(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError>;

    /// Release `Sending` entries whose lock is older than `lease`.
    ///
    /// A reclaimed entry counts as one failed attempt and follows the same
    /// budget rule as `schedule_retry`. Returns how many were released.
    async fn reclaim_expired(&self, queue: &str, lease: Duration) -> Result<usize, OutboxError>;

    async fn get(&self, id: EntryId) -> Result<Option<OutboxEntry>, OutboxError>;

    /// Entries of `queue` in `status`, oldest first.
    async fn list_by_status(
        &self,
        queue: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn stats(&self, queue: &str) -> Result<OutboxStats, OutboxError>;
}

/// Message recorded on entries released by [`OutboxStore::reclaim_expired`].
pub const LEASE_EXPIRED: &str = "lease expired while sending";

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<EntryId, OutboxEntry>,
    dedup: HashSet<(String, String)>,
}

/// In-memory outbox store for tests/dev.
///
/// A single mutex guards all entries, so each trait call is atomic.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
    max_retry: u32,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
            max_retry: MAX_RETRY,
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, OutboxError> {
        self.entries
            .lock()
            .map_err(|_| OutboxError::storage("lock poisoned"))
    }

    /// Move a `Sending` entry to a terminal status.
    fn finish(
        &self,
        id: EntryId,
        worker: &WorkerId,
        to: OutboxStatus,
        error: Option<&str>,
    ) -> Result<(), OutboxError> {
        let mut entries = self.lock()?;
        let entry = claimed_entry(&mut entries, id, worker, to)?;
        entry.release(to);
        if let Some(error) = error {
            entry.last_error = Some(truncate_error(error));
        }
        Ok(())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The `Sending` entry `id`, provided `worker` still holds its claim.
fn claimed_entry<'a>(
    entries: &'a mut Entries,
    id: EntryId,
    worker: &WorkerId,
    to: OutboxStatus,
) -> Result<&'a mut OutboxEntry, OutboxError> {
    let entry = entries.by_id.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
    if !entry.status.can_transition_to(to) || entry.status != OutboxStatus::Sending {
        return Err(OutboxError::InvalidTransition {
            id,
            from: entry.status,
            to,
        });
    }
    if entry.locked_by.as_ref() != Some(worker) {
        return Err(OutboxError::LeaseLost {
            id,
            worker: worker.clone(),
        });
    }
    Ok(entry)
}

fn apply_retry(
    entry: &mut OutboxEntry,
    delay: Duration,
    error: &str,
    max_retry: u32,
    now: chrono::DateTime<chrono::Utc>,
) -> RetryOutcome {
    entry.last_error = Some(truncate_error(error));
    if entry.retry_count >= max_retry {
        entry.release(OutboxStatus::DeadLetter);
        return RetryOutcome::DeadLettered;
    }

    entry.retry_count += 1;
    entry.available_at = now + retry_delay(delay);
    entry.release(OutboxStatus::Pending);
    RetryOutcome::Rescheduled {
        retry_count: entry.retry_count,
        available_at: entry.available_at,
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, job: OutboxJob) -> Result<EnqueueOutcome, OutboxError> {
        let mut entries = self.lock()?;

        let dedup = job
            .dedup_key
            .as_ref()
            .map(|key| (job.queue.clone(), key.clone()));
        let collides = entries.by_id.contains_key(&job.id)
            || dedup.as_ref().is_some_and(|k| entries.dedup.contains(k));
        if collides {
            info!(
                queue = %job.queue,
                entry_id = %job.id,
                dedup_key = ?job.dedup_key,
                "duplicate outbox enqueue ignored"
            );
            return Ok(EnqueueOutcome::Duplicate);
        }

        let id = job.id;
        if let Some(key) = dedup {
            entries.dedup.insert(key);
        }
        entries
            .by_id
            .insert(id, OutboxEntry::pending(job, self.clock.now()));
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim_pending(
        &self,
        queue: &str,
        batch_size: usize,
        worker: &WorkerId,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut entries = self.lock()?;
        let now = self.clock.now();

        let mut ready: Vec<_> = entries
            .by_id
            .values()
            .filter(|e| e.queue == queue && e.is_ready(now))
            .map(|e| (e.available_at, e.created_at, e.id))
            .collect();
        ready.sort();
        ready.truncate(batch_size);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(entry) = entries.by_id.get_mut(&id) {
                entry.claim(worker, now);
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, id: EntryId, worker: &WorkerId) -> Result<(), OutboxError> {
        self.finish(id, worker, OutboxStatus::Sent, None)
    }

    async fn schedule_retry(
        &self,
        id: EntryId,
        worker: &WorkerId,
        delay: Duration,
        error: &str,
    ) -> Result<RetryOutcome, OutboxError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let entry = claimed_entry(&mut entries, id, worker, OutboxStatus::Pending)?;
        Ok(apply_retry(entry, delay, error, self.max_retry, now))
    }

    async fn mark_dead_letter(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        self.finish(id, worker, OutboxStatus::DeadLetter, Some(error))
    }

    async fn mark_failed(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        self.finish(id, worker, OutboxStatus::Failed, Some(error))
    }

    async fn reclaim_expired(&self, queue: &str, lease: Duration) -> Result<usize, OutboxError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let mut entries = self.lock()?;

        let mut reclaimed = 0;
        for entry in entries.by_id.values_mut() {
            let expired = entry.queue == queue
                && entry.status == OutboxStatus::Sending
                && entry.locked_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }
            warn!(
                queue = %entry.queue,
                entry_id = %entry.id,
                locked_by = ?entry.locked_by,
                "reclaiming outbox entry with expired lease"
            );
            apply_retry(entry, Duration::ZERO, LEASE_EXPIRED, self.max_retry, now);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: EntryId) -> Result<Option<OutboxEntry>, OutboxError> {
        Ok(self.lock()?.by_id.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        queue: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.lock()?;
        let mut result: Vec<_> = entries
            .by_id
            .values()
            .filter(|e| e.queue == queue && e.status == status)
            .cloned()
            .collect();

        result.sort_by_key(|e| (e.available_at, e.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, queue: &str) -> Result<OutboxStats, OutboxError> {
        let entries = self.lock()?;
        let mut stats = OutboxStats::default();
        for entry in entries.by_id.values().filter(|e| e.queue == queue) {
            stats.record(entry.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn enqueue(&self, job: OutboxJob) -> Result<EnqueueOutcome, OutboxError> {
        (**self).enqueue(job).await
    }

    async fn claim_pending(
        &self,
        queue: &str,
        batch_size: usize,
        worker: &WorkerId,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        (**self).claim_pending(queue, batch_size, worker).await
    }

    async fn mark_completed(&self, id: EntryId, worker: &WorkerId) -> Result<(), OutboxError> {
        (**self).mark_completed(id, worker).await
    }

    async fn schedule_retry(
        &self,
        id: EntryId,
        worker: &WorkerId,
        delay: Duration,
        error: &str,
    ) -> Result<RetryOutcome, OutboxError> {
        (**self).schedule_retry(id, worker, delay, error).await
    }

    async fn mark_dead_letter(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        (**self).mark_dead_letter(id, worker, error).await
    }

    async fn mark_failed(
        &self,
        id: EntryId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        (**self).mark_failed(id, worker, error).await
    }

    async fn reclaim_expired(&self, queue: &str, lease: Duration) -> Result<usize, OutboxError> {
        (**self).reclaim_expired(queue, lease).await
    }

    async fn get(&self, id: EntryId) -> Result<Option<OutboxEntry>, OutboxError> {
        (**self).get(id).await
    }

    async fn list_by_status(
        &self,
        queue: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        (**self).list_by_status(queue, status, limit).await
    }

    async fn stats(&self, queue: &str) -> Result<OutboxStats, OutboxError> {
        (**self).stats(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use steward_core::ManualClock;

    const QUEUE: &str = "file_audit";

    fn setup() -> (Arc<InMemoryOutboxStore>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let store = Arc::new(InMemoryOutboxStore::with_clock(Arc::new(clock.clone())));
        (store, clock)
    }

    fn worker() -> WorkerId {
        WorkerId::new("worker-1").unwrap()
    }

    fn job(job_type: &str) -> OutboxJob {
        OutboxJob::new(QUEUE, job_type, serde_json::json!({"job": job_type}))
    }

    async fn enqueue_and_claim(store: &InMemoryOutboxStore) -> EntryId {
        let id = store.enqueue(job("upload")).await.unwrap().entry_id().unwrap();
        let claimed = store.claim_pending(QUEUE, 1, &worker()).await.unwrap();
        assert_eq!(claimed[0].id, id);
        id
    }

    #[tokio::test]
    async fn retry_after_timeout_reschedules_entry() {
        let (store, clock) = setup();
        let id = store.enqueue(job("JOB_A")).await.unwrap().entry_id().unwrap();

        let claimed = store.claim_pending(QUEUE, 10, &worker()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, OutboxStatus::Sending);
        assert_eq!(claimed[0].locked_by, Some(worker()));
        assert_eq!(claimed[0].locked_at, Some(clock.now()));

        let failed_at = clock.now();
        let outcome = store
            .schedule_retry(id, &worker(), Duration::from_secs(10), "timeout")
            .await
            .unwrap();

        let expected_at = failed_at + chrono::Duration::seconds(10);
        assert_eq!(
            outcome,
            RetryOutcome::Rescheduled {
                retry_count: 1,
                available_at: expected_at
            }
        );

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.available_at, expected_at);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
        assert!(entry.lock_is_consistent());
    }

    #[tokio::test]
    async fn retried_entry_is_not_claimable_before_its_delay() {
        let (store, clock) = setup();
        let id = enqueue_and_claim(&store).await;
        store
            .schedule_retry(id, &worker(), Duration::from_secs(30), "busy")
            .await
            .unwrap();

        assert!(store.claim_pending(QUEUE, 10, &worker()).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(30));
        let claimed = store.claim_pending(QUEUE, 10, &worker()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_instead_of_retrying() {
        let (store, clock) = setup();
        let id = enqueue_and_claim(&store).await;

        for _ in 0..MAX_RETRY {
            store
                .schedule_retry(id, &worker(), Duration::from_secs(1), "still failing")
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
            let claimed = store.claim_pending(QUEUE, 1, &worker()).await.unwrap();
            assert_eq!(claimed.len(), 1);
        }

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, MAX_RETRY);

        let outcome = store
            .schedule_retry(id, &worker(), Duration::from_secs(1), "final")
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::DeadLettered);

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::DeadLetter);
        assert_eq!(entry.retry_count, MAX_RETRY);
        assert_eq!(entry.last_error.as_deref(), Some("final"));
        assert!(entry.lock_is_consistent());
    }

    #[tokio::test]
    async fn duplicate_natural_key_is_a_silent_no_op() {
        let (store, _clock) = setup();

        let first = store
            .enqueue(job("sync").with_dedup_key("org-42"))
            .await
            .unwrap();
        let second = store
            .enqueue(job("sync").with_dedup_key("org-42"))
            .await
            .unwrap();

        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(second, EnqueueOutcome::Duplicate);

        let pending = store
            .list_by_status(QUEUE, OutboxStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn same_dedup_key_in_other_queue_is_independent() {
        let (store, _clock) = setup();
        store.enqueue(job("a").with_dedup_key("k")).await.unwrap();
        let other = OutboxJob::new("draft_audit", "a", serde_json::json!({})).with_dedup_key("k");
        assert!(matches!(
            store.enqueue(other).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn claim_is_oldest_first_and_bounded() {
        let (store, clock) = setup();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = store
                .enqueue(job(&format!("job-{i}")))
                .await
                .unwrap()
                .entry_id()
                .unwrap();
            ids.push(id);
            clock.advance(Duration::from_secs(1));
        }

        let first = store.claim_pending(QUEUE, 3, &worker()).await.unwrap();
        assert_eq!(
            first.iter().map(|e| e.id).collect::<Vec<_>>(),
            ids[..3].to_vec()
        );

        let rest = store.claim_pending(QUEUE, 10, &worker()).await.unwrap();
        assert_eq!(rest.iter().map(|e| e.id).collect::<Vec<_>>(), ids[3..].to_vec());
        assert!(store.claim_pending(QUEUE, 10, &worker()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_only_sees_its_queue() {
        let (store, _clock) = setup();
        store
            .enqueue(OutboxJob::new("ingestion", "t", serde_json::json!({})))
            .await
            .unwrap();
        assert!(store.claim_pending(QUEUE, 10, &worker()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_and_dead_letter_are_distinct_terminal_states() {
        let (store, _clock) = setup();
        let failed = enqueue_and_claim(&store).await;
        store.mark_failed(failed, &worker(), "invalid payload").await.unwrap();
        let dead = enqueue_and_claim(&store).await;
        store.mark_dead_letter(dead, &worker(), "gave up").await.unwrap();

        assert_eq!(
            store.get(failed).await.unwrap().unwrap().status,
            OutboxStatus::Failed
        );
        assert_eq!(
            store.get(dead).await.unwrap().unwrap().status,
            OutboxStatus::DeadLetter
        );

        let stats = store.stats(QUEUE).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_letter, 1);
    }

    #[tokio::test]
    async fn transitions_require_sending() {
        let (store, _clock) = setup();
        let id = store.enqueue(job("x")).await.unwrap().entry_id().unwrap();

        let err = store.mark_completed(id, &worker()).await.unwrap_err();
        assert!(matches!(
            err,
            OutboxError::InvalidTransition {
                from: OutboxStatus::Pending,
                to: OutboxStatus::Sent,
                ..
            }
        ));

        store.claim_pending(QUEUE, 1, &worker()).await.unwrap();
        store.mark_completed(id, &worker()).await.unwrap();

        let err = store
            .schedule_retry(id, &worker(), Duration::from_secs(1), "late")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidTransition { from: OutboxStatus::Sent, .. }));

        let missing = EntryId::new();
        assert!(matches!(
            store.mark_failed(missing, &worker(), "x").await,
            Err(OutboxError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn long_errors_are_truncated() {
        let (store, _clock) = setup();
        let long = "x".repeat(2_000);

        let retried = enqueue_and_claim(&store).await;
        store
            .schedule_retry(retried, &worker(), Duration::from_secs(1), &long)
            .await
            .unwrap();
        let dead = enqueue_and_claim(&store).await;
        store.mark_dead_letter(dead, &worker(), &long).await.unwrap();

        for id in [retried, dead] {
            let entry = store.get(id).await.unwrap().unwrap();
            assert_eq!(entry.last_error.unwrap().chars().count(), 500);
        }
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let (store, clock) = setup();
        let stuck = enqueue_and_claim(&store).await;

        assert_eq!(
            store
                .reclaim_expired(QUEUE, Duration::from_secs(60))
                .await
                .unwrap(),
            0
        );

        clock.advance(Duration::from_secs(61));
        assert_eq!(
            store
                .reclaim_expired(QUEUE, Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );

        let entry = store.get(stuck).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert!(entry.available_at > clock.now());
        assert!(entry.lock_is_consistent());
    }

    #[tokio::test]
    async fn stale_worker_cannot_touch_a_reclaimed_entry() {
        let (store, clock) = setup();
        let stale = worker();
        let current = WorkerId::new("worker-2").unwrap();
        let id = enqueue_and_claim(&store).await;

        clock.advance(Duration::from_secs(301));
        store
            .reclaim_expired(QUEUE, Duration::from_secs(300))
            .await
            .unwrap();

        // Released but not yet re-claimed: the old claim is simply gone.
        assert!(matches!(
            store.mark_completed(id, &stale).await,
            Err(OutboxError::InvalidTransition { from: OutboxStatus::Pending, .. })
        ));

        clock.advance(Duration::from_secs(1));
        let claimed = store.claim_pending(QUEUE, 1, &current).await.unwrap();
        assert_eq!(claimed[0].locked_by.as_ref(), Some(&current));

        assert!(matches!(
            store.mark_dead_letter(id, &stale, "gave up").await,
            Err(OutboxError::LeaseLost { worker, .. }) if worker == stale
        ));
        assert!(matches!(
            store.schedule_retry(id, &stale, Duration::from_secs(1), "late").await,
            Err(OutboxError::LeaseLost { .. })
        ));
        assert!(matches!(
            store.mark_failed(id, &stale, "late").await,
            Err(OutboxError::LeaseLost { .. })
        ));

        store.mark_completed(id, &current).await.unwrap();
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Sent);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.lock_is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        let store = InMemoryOutboxStore::arc();
        for i in 0..200 {
            store
                .enqueue(job(&format!("job-{i}")))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let worker = WorkerId::new(format!("worker-{w}")).unwrap();
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_pending(QUEUE, 7, &worker).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    for entry in batch {
                        assert_eq!(entry.locked_by.as_ref(), Some(&worker));
                        mine.push(entry.id);
                    }
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "entry {id} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 200);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: retry_count never decreases across schedule_retry calls,
        /// and an entry at budget always dead-letters.
        #[test]
        fn retry_count_is_monotonic(
            delays in prop::collection::vec(0u64..120, 1..12),
            max_retry in 0u32..8,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let clock = ManualClock::default();
                let store = InMemoryOutboxStore::with_clock(Arc::new(clock.clone()))
                    .with_max_retry(max_retry);
                let id = enqueue_and_claim(&store).await;

                let mut last = 0;
                for delay in delays {
                    let before = store.get(id).await.unwrap().unwrap();
                    let outcome = store
                        .schedule_retry(id, &worker(), Duration::from_secs(delay), "boom")
                        .await
                        .unwrap();
                    let after = store.get(id).await.unwrap().unwrap();

                    prop_assert!(after.retry_count >= last);
                    last = after.retry_count;

                    if before.retry_count >= max_retry {
                        prop_assert_eq!(outcome, RetryOutcome::DeadLettered);
                        prop_assert_eq!(after.status, OutboxStatus::DeadLetter);
                        break;
                    }
                    prop_assert_eq!(after.status, OutboxStatus::Pending);
                    prop_assert!(after.available_at > clock.now());

                    clock.advance(Duration::from_secs(delay + 1));
                    let claimed = store.claim_pending(QUEUE, 1, &worker()).await.unwrap();
                    prop_assert_eq!(claimed.len(), 1);
                }
                Ok(())
            })?;
        }

        /// Property: two interleaved claimers never receive the same entry.
        #[test]
        fn interleaved_claims_are_disjoint(
            entries in 1usize..60,
            batch_a in 1usize..10,
            batch_b in 1usize..10,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryOutboxStore::new();
                for i in 0..entries {
                    store.enqueue(job(&format!("j{i}"))).await.unwrap();
                }
                let a = WorkerId::new("a").unwrap();
                let b = WorkerId::new("b").unwrap();

                let mut seen = HashSet::new();
                loop {
                    let from_a = store.claim_pending(QUEUE, batch_a, &a).await.unwrap();
                    let from_b = store.claim_pending(QUEUE, batch_b, &b).await.unwrap();
                    if from_a.is_empty() && from_b.is_empty() {
                        break;
                    }
                    for entry in from_a.into_iter().chain(from_b) {
                        prop_assert!(seen.insert(entry.id));
                    }
                }
                prop_assert_eq!(seen.len(), entries);
                Ok(())
            })?;
        }
    }
}
