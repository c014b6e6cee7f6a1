//! Range deletion scheduler: persistence, promotion, and execution of tasks

use super::telemetry;
use super::{
    DeletionThrottle, ExecutionOutcome, RangeDeleterConfig, RangeDeletionTask, VisibilityFence,
    WhenToClean,
};
use crate::clock::BoundedClock;
use crate::durable::{DocumentCollection, DocumentKind, DurableLog};
use crate::routing::{KeyRange, RoutingCatalog, ShardId};
use crate::shard::ShardStore;
use crate::{Error, Result};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct QueuedTask {
    task: RangeDeletionTask,
    running: bool,
    attempts: u32,
    next_attempt_at: Option<Instant>,
}

impl QueuedTask {
    fn new(task: RangeDeletionTask) -> Self {
        Self {
            task,
            running: false,
            attempts: 0,
            next_attempt_at: None,
        }
    }

    fn is_runnable(&self, now: Instant) -> bool {
        !self.running
            && !self.task.pending
            && !self.task.is_reservation()
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Tasks that hold up an incoming migration of an overlapping range
    fn blocks_incoming(&self, namespace: &str, range: &KeyRange) -> bool {
        !self.task.is_reservation()
            && self.task.namespace == namespace
            && self.task.range.overlaps(range)
    }
}

/// What one scheduler pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks whose fence cleared and became runnable
    pub promoted: usize,
    /// Tasks handed to a worker
    pub dispatched: usize,
    /// Runnable tasks left for a later pass because all workers were busy
    pub deferred: usize,
}

/// Per-shard range deletion scheduler
pub struct RangeDeletionScheduler {
    shard_id: ShardId,
    config: RangeDeleterConfig,
    store: Arc<dyn ShardStore>,
    tasks: DocumentCollection<RangeDeletionTask>,
    catalog: Arc<dyn RoutingCatalog>,
    fence: Arc<dyn VisibilityFence>,
    clock: Arc<BoundedClock>,
    throttle: DeletionThrottle,
    queue: Mutex<BTreeMap<Uuid, QueuedTask>>,
    workers: Arc<Semaphore>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl RangeDeletionScheduler {
    pub fn new(
        shard_id: ShardId,
        config: RangeDeleterConfig,
        store: Arc<dyn ShardStore>,
        log: Arc<dyn DurableLog>,
        catalog: Arc<dyn RoutingCatalog>,
        fence: Arc<dyn VisibilityFence>,
        clock: Arc<BoundedClock>,
    ) -> Self {
        Self {
            throttle: DeletionThrottle::new(config.max_docs_per_second),
            workers: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            shard_id,
            config,
            store,
            tasks: DocumentCollection::new(log, DocumentKind::RangeDeletions),
            catalog,
            fence,
            clock,
            queue: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn config(&self) -> &RangeDeleterConfig {
        &self.config
    }

    pub fn fence(&self) -> &Arc<dyn VisibilityFence> {
        &self.fence
    }

    /// Get a cancellation token that can be used to stop [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Durably record a task (insert or replace) and queue it.
    pub async fn enqueue(&self, task: RangeDeletionTask) -> Result<()> {
        self.tasks.put(&task.task_id.to_string(), &task).await?;
        debug!(
            shard = %self.shard_id,
            task_id = %task.task_id,
            namespace = %task.namespace,
            range = %task.range,
            reservation = task.is_reservation(),
            "Enqueued range deletion task"
        );
        let depth = {
            let mut queue = self.queue.lock();
            match queue.get_mut(&task.task_id) {
                Some(existing) => existing.task = task,
                None => {
                    queue.insert(task.task_id, QueuedTask::new(task));
                }
            }
            queue.len()
        };
        telemetry::record_queue_depth(&self.shard_id, depth);
        self.wake.notify_one();
        Ok(())
    }

    /// Durably remove a task without executing it. Removing an unknown task succeeds.
    pub async fn forget(&self, task_id: Uuid) -> Result<()> {
        self.tasks.remove(&task_id.to_string()).await?;
        let depth = {
            let mut queue = self.queue.lock();
            queue.remove(&task_id);
            queue.len()
        };
        telemetry::record_queue_depth(&self.shard_id, depth);
        Ok(())
    }

    /// Load every persisted task into the queue. Returns how many were loaded.
    pub async fn recover(&self) -> Result<usize> {
        let persisted = self.tasks.list().await?;
        let count = persisted.len();
        let depth = {
            let mut queue = self.queue.lock();
            for task in persisted {
                queue
                    .entry(task.task_id)
                    .or_insert_with(|| QueuedTask::new(task));
            }
            queue.len()
        };
        telemetry::record_queue_depth(&self.shard_id, depth);
        info!(shard = %self.shard_id, count, "Recovered range deletion tasks");
        Ok(count)
    }

    /// Tasks currently known to the scheduler, reservations included
    pub fn tasks(&self) -> Vec<RangeDeletionTask> {
        self.queue.lock().values().map(|q| q.task.clone()).collect()
    }

    pub fn task(&self, task_id: Uuid) -> Option<RangeDeletionTask> {
        self.queue.lock().get(&task_id).map(|q| q.task.clone())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of tasks that still have deleting left to do (reservations excluded)
    pub fn outstanding(&self) -> usize {
        self.queue
            .lock()
            .values()
            .filter(|q| !q.task.is_reservation())
            .count()
    }

    /// One scheduler pass: promote tasks whose fence cleared, then hand
    /// runnable tasks to free workers.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let promotable: Vec<RangeDeletionTask> = {
            let queue = self.queue.lock();
            queue
                .values()
                .filter(|q| !q.running && q.task.pending && !q.task.is_reservation())
                .filter(|q| self.ready_to_promote(&q.task))
                .map(|q| q.task.clone())
                .collect()
        };
        for mut task in promotable {
            task.pending = false;
            if let Err(e) = self.tasks.put(&task.task_id.to_string(), &task).await {
                warn!(task_id = %task.task_id, error = %e, "Failed to persist task promotion");
                continue;
            }
            if let Some(queued) = self.queue.lock().get_mut(&task.task_id) {
                queued.task.pending = false;
            }
            info!(
                shard = %self.shard_id,
                task_id = %task.task_id,
                namespace = %task.namespace,
                range = %task.range,
                "Range deletion task is now runnable"
            );
            report.promoted += 1;
        }

        let now = Instant::now();
        let mut to_run = Vec::new();
        {
            let mut queue = self.queue.lock();
            let candidates: Vec<Uuid> = queue
                .iter()
                .filter(|(_, q)| q.is_runnable(now))
                .map(|(id, _)| *id)
                .collect();

            for id in candidates {
                let Some(candidate) = queue.get(&id) else {
                    continue;
                };
                // overlapping tasks of one namespace run one at a time
                let conflicts = queue.values().any(|other| {
                    other.running
                        && other.task.namespace == candidate.task.namespace
                        && other.task.range.overlaps(&candidate.task.range)
                });
                if conflicts {
                    continue;
                }
                match self.workers.clone().try_acquire_owned() {
                    Ok(permit) => {
                        if let Some(queued) = queue.get_mut(&id) {
                            queued.running = true;
                            to_run.push((queued.task.clone(), permit));
                        }
                    }
                    Err(_) => report.deferred += 1,
                }
            }
        }
        if report.deferred > 0 {
            debug!(shard = %self.shard_id, deferred = report.deferred, "Range deleter at capacity");
            telemetry::record_deferred(&self.shard_id, report.deferred);
        }

        report.dispatched = to_run.len();
        for (task, permit) in to_run {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = this.execute(&task).await;
                this.finish(&task, outcome).await;
            });
        }
        Ok(report)
    }

    fn ready_to_promote(&self, task: &RangeDeletionTask) -> bool {
        if !self.fence.is_clear(task, &self.clock) {
            return false;
        }
        match (task.when_to_clean, task.handed_off_at) {
            (WhenToClean::Immediate, _) => true,
            (WhenToClean::Delayed(delay), Some(at)) => self.clock.has_elapsed(at, delay),
            (WhenToClean::Delayed(_), None) => false,
        }
    }

    /// Run one task to completion or to its first failure.
    ///
    /// Ownership and collection generation are re-verified before every
    /// batch, so a task that has gone stale never deletes anything.
    pub async fn execute(&self, task: &RangeDeletionTask) -> ExecutionOutcome {
        if task.pending || task.is_reservation() {
            return ExecutionOutcome::Retry(self.config.tick_interval);
        }

        let mut deleted = 0u64;
        loop {
            match self.stale_reason(task).await {
                Ok(None) => {}
                Ok(Some(reason)) => return ExecutionOutcome::PermanentlyStale(reason),
                Err(e) => return self.retry_after(task, &e),
            }

            self.throttle.acquire(self.config.batch_size as u64).await;
            let started = std::time::Instant::now();
            let result = self
                .store
                .delete_range_batch(
                    &task.namespace,
                    task.collection_uuid,
                    &task.range,
                    self.config.batch_size,
                )
                .await;

            match result {
                Ok(0) => return ExecutionOutcome::Completed { deleted },
                Ok(n) => {
                    deleted += n;
                    telemetry::record_batch(&self.shard_id, n, started.elapsed().as_secs_f64());
                    if let Some(queued) = self.queue.lock().get_mut(&task.task_id) {
                        queued.task.deleted_count += n;
                    }
                    if !self.config.batch_delay.is_zero() {
                        tokio::time::sleep(self.config.batch_delay).await;
                    }
                }
                Err(Error::NamespaceNotFound(ns)) => {
                    return ExecutionOutcome::PermanentlyStale(format!(
                        "namespace {} no longer exists",
                        ns
                    ))
                }
                Err(e @ Error::CollectionUuidMismatch { .. }) => {
                    return ExecutionOutcome::PermanentlyStale(e.to_string())
                }
                Err(e) => return self.retry_after(task, &e),
            }
        }
    }

    /// `Some(reason)` if the task must not delete anything anymore
    async fn stale_reason(&self, task: &RangeDeletionTask) -> Result<Option<String>> {
        match self.store.collection_uuid(&task.namespace).await? {
            None => {
                return Ok(Some(format!(
                    "namespace {} no longer exists on {}",
                    task.namespace, self.shard_id
                )))
            }
            Some(uuid) if uuid != task.collection_uuid => {
                return Ok(Some(format!(
                    "namespace {} was recreated (uuid {} != {})",
                    task.namespace, uuid, task.collection_uuid
                )))
            }
            Some(_) => {}
        }

        let reason = match self.catalog.get_collection(&task.namespace).await? {
            None => Some(format!(
                "namespace {} dropped from routing catalog",
                task.namespace
            )),
            Some(routing) if routing.collection_uuid != task.collection_uuid => Some(format!(
                "routing catalog has a new generation of {}",
                task.namespace
            )),
            Some(routing) if routing.owns_any(&self.shard_id, &task.range) => Some(format!(
                "{} owns {} again at epoch {}",
                self.shard_id, task.range, routing.epoch
            )),
            Some(_) => None,
        };
        Ok(reason)
    }

    fn retry_after(&self, task: &RangeDeletionTask, error: &Error) -> ExecutionOutcome {
        let attempts = self
            .queue
            .lock()
            .get(&task.task_id)
            .map(|q| q.attempts)
            .unwrap_or(0)
            + 1;
        let backoff = self.config.backoff_for(attempts);
        warn!(
            shard = %self.shard_id,
            task_id = %task.task_id,
            attempt = attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Range deletion failed, will retry"
        );
        ExecutionOutcome::Retry(backoff)
    }

    async fn finish(&self, task: &RangeDeletionTask, outcome: ExecutionOutcome) {
        let (label, done) = match &outcome {
            ExecutionOutcome::Completed { .. } => ("completed", true),
            ExecutionOutcome::PermanentlyStale(_) => ("stale", true),
            ExecutionOutcome::Retry(_) => ("retry", false),
        };

        if done {
            if let Err(e) = self.tasks.remove(&task.task_id.to_string()).await {
                error!(
                    task_id = %task.task_id,
                    error = %e,
                    "Failed to remove finished range deletion task"
                );
                self.reschedule(task.task_id, self.config.backoff_for(1));
                return;
            }
            let depth = {
                let mut queue = self.queue.lock();
                queue.remove(&task.task_id);
                queue.len()
            };
            telemetry::record_task_finished(&self.shard_id, label);
            telemetry::record_queue_depth(&self.shard_id, depth);
            match outcome {
                ExecutionOutcome::Completed { deleted } => info!(
                    shard = %self.shard_id,
                    task_id = %task.task_id,
                    namespace = %task.namespace,
                    range = %task.range,
                    deleted,
                    "Range deletion completed"
                ),
                ExecutionOutcome::PermanentlyStale(reason) => info!(
                    shard = %self.shard_id,
                    task_id = %task.task_id,
                    %reason,
                    "Dropping stale range deletion task"
                ),
                ExecutionOutcome::Retry(_) => {}
            }
            return;
        }

        if let ExecutionOutcome::Retry(delay) = outcome {
            telemetry::record_retry(&self.shard_id);
            self.reschedule(task.task_id, delay);
        }
    }

    fn reschedule(&self, task_id: Uuid, delay: Duration) {
        if let Some(queued) = self.queue.lock().get_mut(&task_id) {
            queued.running = false;
            queued.attempts += 1;
            queued.next_attempt_at = Some(Instant::now() + delay);
        }
    }

    /// Wait until no handed-off task overlaps `range`, failing after `timeout`.
    pub async fn wait_for_clean(
        &self,
        namespace: &str,
        range: &KeyRange,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let blocking = self
                .queue
                .lock()
                .values()
                .filter(|q| q.blocks_incoming(namespace, range))
                .count();
            if blocking == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeadlineExceeded {
                    operation: "wait for overlapping range deletions",
                    limit: timeout,
                });
            }
            debug!(
                shard = %self.shard_id,
                namespace,
                %range,
                blocking,
                "Waiting for overlapping range deletions"
            );
            tokio::time::sleep(self.config.tick_interval.min(deadline - now)).await;
        }
    }

    /// Tick until every handed-off task has finished, failing after `timeout`.
    pub async fn run_until_idle(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick().await?;
            if self.outstanding() == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeadlineExceeded {
                    operation: "range deleter drain",
                    limit: timeout,
                });
            }
            tokio::time::sleep(self.config.tick_interval.min(deadline - now)).await;
        }
    }

    /// Run the scheduler loop. Returns when the shutdown token is cancelled.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.recover().await {
            warn!(shard = %self.shard_id, "Failed to load persisted range deletion tasks: {}", e);
        }

        // a zero period would panic inside tokio
        let period = self.config.tick_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                _ = self.shutdown.cancelled() => {
                    info!(shard = %self.shard_id, "Range deleter shutting down gracefully");
                    break;
                }
            }
            if let Err(e) = self.tick().await {
                error!(shard = %self.shard_id, "Range deleter pass failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::ObjectStoreLog;
    use crate::migration::MigrationId;
    use crate::range_deleter::{MigrationSide, StalenessTimerFence};
    use crate::routing::{ChunkOwnership, LocalRoutingCatalog};
    use crate::shard::{Document, MemoryShardStore};
    use chrono::Utc;
    use object_store::memory::InMemory;
    use serde_json::json;

    struct Fixture {
        scheduler: Arc<RangeDeletionScheduler>,
        store: Arc<MemoryShardStore>,
        uuid: Uuid,
    }

    /// Shard "a" holding docs 0..100 while the catalog says "b" owns [0, 50)
    async fn fixture(config: RangeDeleterConfig) -> Fixture {
        let uuid = Uuid::new_v4();
        let store = Arc::new(MemoryShardStore::new());
        store.create_collection("db.c", uuid).await.unwrap();
        for i in 0..100u64 {
            store
                .upsert("db.c", Document::new(i, json!({ "i": i })))
                .await
                .unwrap();
        }
        let catalog = Arc::new(LocalRoutingCatalog::new());
        catalog
            .create_collection(
                "db.c",
                uuid,
                vec![
                    ChunkOwnership::new(KeyRange::from_u64(0, 50), "b"),
                    ChunkOwnership::new(KeyRange::from_u64(50, 100), "a"),
                ],
            )
            .await
            .unwrap();
        let clock = Arc::new(BoundedClock::new(Duration::ZERO));
        let scheduler = Arc::new(RangeDeletionScheduler::new(
            "a".to_string(),
            config,
            store.clone(),
            Arc::new(ObjectStoreLog::for_shard(Arc::new(InMemory::new()), "a", clock.clone())),
            catalog,
            Arc::new(StalenessTimerFence::new(Duration::ZERO)),
            clock,
        ));
        Fixture {
            scheduler,
            store,
            uuid,
        }
    }

    fn fast_config() -> RangeDeleterConfig {
        RangeDeleterConfig {
            batch_size: 16,
            batch_delay: Duration::ZERO,
            tick_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn handed_off(uuid: Uuid, range: KeyRange) -> RangeDeletionTask {
        let mut task = RangeDeletionTask::reservation(
            Uuid::new_v4(),
            MigrationId::new(),
            MigrationSide::Donor,
            "db.c",
            uuid,
            range,
            "a",
        );
        task.hand_off(2, WhenToClean::Immediate, Utc::now());
        task
    }

    #[tokio::test]
    async fn test_run_loop_survives_zero_tick_interval() {
        let f = fixture(RangeDeleterConfig {
            tick_interval: Duration::ZERO,
            ..fast_config()
        })
        .await;
        let range = KeyRange::from_u64(0, 50);
        f.scheduler.enqueue(handed_off(f.uuid, range.clone())).await.unwrap();

        let shutdown = f.scheduler.shutdown_token();
        let running = tokio::spawn(f.scheduler.clone().run());
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.store.count_in_range("db.c", &range).await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_handed_off_task_deletes_orphans() {
        let f = fixture(fast_config()).await;
        let range = KeyRange::from_u64(0, 50);
        f.scheduler.enqueue(handed_off(f.uuid, range.clone())).await.unwrap();

        f.scheduler
            .run_until_idle(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(f.store.count_in_range("db.c", &range).await.unwrap(), 0);
        assert_eq!(
            f.store
                .count_in_range("db.c", &KeyRange::from_u64(50, 100))
                .await
                .unwrap(),
            50,
            "documents outside the task range must survive"
        );
        assert_eq!(f.scheduler.queue_len(), 0);
        assert_eq!(
            f.scheduler.recover().await.unwrap(),
            0,
            "finished task must be removed durably"
        );
    }

    #[tokio::test]
    async fn test_stale_generation_deletes_nothing() {
        let f = fixture(fast_config()).await;
        let range = KeyRange::from_u64(0, 50);
        let task = {
            let mut task = handed_off(Uuid::new_v4(), range.clone());
            task.pending = false;
            task
        };

        let outcome = f.scheduler.execute(&task).await;
        assert!(
            matches!(outcome, ExecutionOutcome::PermanentlyStale(_)),
            "expected stale outcome, got {:?}",
            outcome
        );
        assert_eq!(f.store.count_in_range("db.c", &range).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_owned_range_is_never_deleted() {
        let f = fixture(fast_config()).await;
        // "a" still owns [50, 100)
        let range = KeyRange::from_u64(50, 100);
        let mut task = handed_off(f.uuid, range.clone());
        task.pending = false;

        let outcome = f.scheduler.execute(&task).await;
        assert!(matches!(outcome, ExecutionOutcome::PermanentlyStale(_)));
        assert_eq!(f.store.count_in_range("db.c", &range).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_reservations_are_not_executed() {
        let f = fixture(fast_config()).await;
        let reservation = RangeDeletionTask::reservation(
            Uuid::new_v4(),
            MigrationId::new(),
            MigrationSide::Donor,
            "db.c",
            f.uuid,
            KeyRange::from_u64(0, 50),
            "a",
        );
        let task_id = reservation.task_id;
        f.scheduler.enqueue(reservation).await.unwrap();

        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(f.scheduler.outstanding(), 0);

        f.scheduler.forget(task_id).await.unwrap();
        assert_eq!(f.scheduler.queue_len(), 0);
        assert_eq!(
            f.store
                .count_in_range("db.c", &KeyRange::from_u64(0, 50))
                .await
                .unwrap(),
            50
        );
    }

    #[tokio::test]
    async fn test_delayed_task_stays_pending() {
        let f = fixture(fast_config()).await;
        let mut task = handed_off(f.uuid, KeyRange::from_u64(0, 50));
        task.when_to_clean = WhenToClean::Delayed(Duration::from_secs(3600));
        f.scheduler.enqueue(task.clone()).await.unwrap();

        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report.promoted, 0);
        assert!(f.scheduler.task(task.task_id).unwrap().pending);
    }

    #[tokio::test]
    async fn test_overlapping_tasks_are_serialized() {
        let config = RangeDeleterConfig {
            max_concurrent_tasks: 4,
            batch_size: 1,
            batch_delay: Duration::from_millis(20),
            tick_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let f = fixture(config).await;
        f.scheduler
            .enqueue(handed_off(f.uuid, KeyRange::from_u64(0, 30)))
            .await
            .unwrap();
        f.scheduler
            .enqueue(handed_off(f.uuid, KeyRange::from_u64(20, 50)))
            .await
            .unwrap();

        let first = f.scheduler.tick().await.unwrap();
        assert_eq!(first.promoted, 2);
        assert_eq!(first.dispatched, 1, "overlapping task must wait for the running one");

        f.scheduler
            .run_until_idle(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            f.store
                .count_in_range("db.c", &KeyRange::from_u64(0, 50))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_wait_for_clean_times_out_on_overlap() {
        let f = fixture(fast_config()).await;
        let mut task = handed_off(f.uuid, KeyRange::from_u64(0, 50));
        task.when_to_clean = WhenToClean::Delayed(Duration::from_secs(3600));
        f.scheduler.enqueue(task).await.unwrap();

        let err = f
            .scheduler
            .wait_for_clean("db.c", &KeyRange::from_u64(40, 60), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));

        f.scheduler
            .wait_for_clean("db.c", &KeyRange::from_u64(50, 60), Duration::from_millis(30))
            .await
            .unwrap();
    }
}
