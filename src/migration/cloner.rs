//! Range cloner: bulk copy plus change-log catch-up from donor to recipient

use super::telemetry;
use super::{MigrationConfig, MigrationId};
use crate::routing::{KeyRange, ShardKey};
use crate::shard::{Shard, ShardStore};
use crate::{Error, Result};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Live clone counters, readable while a clone runs
#[derive(Debug, Default)]
pub struct CloneProgress {
    docs_cloned: AtomicU64,
    mods_applied: AtomicU64,
}

impl CloneProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn docs_cloned(&self) -> u64 {
        self.docs_cloned.load(Ordering::Relaxed)
    }

    pub fn mods_applied(&self) -> u64 {
        self.mods_applied.load(Ordering::Relaxed)
    }

    fn add_docs(&self, count: u64) {
        self.docs_cloned.fetch_add(count, Ordering::Relaxed);
        telemetry::record_documents_cloned(count);
    }

    fn add_mods(&self, count: u64) {
        self.mods_applied.fetch_add(count, Ordering::Relaxed);
        telemetry::record_changes_applied(count);
    }
}

/// Where a clone got to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClonedMarker {
    pub docs_cloned: u64,
    pub mods_applied: u64,
    /// Donor change sequence up to which the recipient is consistent
    pub last_applied_seq: u64,
}

/// What to clone
pub struct CloneRequest<'a> {
    pub migration_id: MigrationId,
    pub namespace: &'a str,
    pub collection_uuid: Uuid,
    pub range: &'a KeyRange,
    pub donor: &'a Shard,
    pub recipient: &'a Shard,
}

/// Copies one range of a namespace between shards.
///
/// The donor's change sequence is recorded before the scan starts, so every
/// write that lands during the bulk copy is replayed afterwards. Replaying a
/// change the scan already saw is harmless because later records overwrite it.
pub struct RangeCloner {
    config: MigrationConfig,
}

impl RangeCloner {
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Bulk copy `range`, then catch up until at most `max_catchup_lag`
    /// changes are outstanding.
    pub async fn clone_range(
        &self,
        request: &CloneRequest<'_>,
        progress: &CloneProgress,
        cancel: &CancellationToken,
    ) -> Result<ClonedMarker> {
        let deadline = Instant::now() + self.config.clone_timeout;
        let donor: &dyn ShardStore = request.donor.store().as_ref();
        let recipient: &dyn ShardStore = request.recipient.store().as_ref();
        let namespace = request.namespace;
        let range = request.range;
        let batch_size = self.config.clone_batch_size;

        self.check_generation(request, deadline, cancel).await?;
        let start_seq = self
            .with_retry("read donor change position", deadline, cancel, move || {
                donor.latest_seq()
            })
            .await?;

        let mut marker = ClonedMarker {
            last_applied_seq: start_seq,
            ..Default::default()
        };
        let mut cursor: Option<ShardKey> = None;
        loop {
            let after = cursor.clone();
            let batch = self
                .with_retry("scan donor range", deadline, cancel, move || {
                    let after = after.clone();
                    async move {
                        donor
                            .scan_range(namespace, range, after.as_ref(), batch_size)
                            .await
                    }
                })
                .await?;
            let Some(last) = batch.last().map(|d| d.key.clone()) else {
                break;
            };
            let fetched = batch.len();

            let written = self
                .with_retry("write recipient batch", deadline, cancel, move || {
                    recipient.upsert_batch(namespace, batch.clone())
                })
                .await?;
            marker.docs_cloned += written;
            progress.add_docs(written);
            cursor = Some(last);

            if fetched < batch_size {
                break;
            }
            // a drop-and-recreate mid-scan would otherwise go unnoticed
            self.check_generation(request, deadline, cancel).await?;
        }
        debug!(
            migration_id = %request.migration_id,
            docs = marker.docs_cloned,
            "Bulk copy finished, catching up"
        );

        loop {
            let since = marker.last_applied_seq;
            let outstanding = self
                .with_retry("count donor changes", deadline, cancel, move || {
                    donor.count_changes_since(namespace, range, since)
                })
                .await?;
            if outstanding <= self.config.max_catchup_lag {
                break;
            }
            self.apply_batch(request, &mut marker, progress, deadline, cancel)
                .await?;
        }

        info!(
            migration_id = %request.migration_id,
            namespace,
            %range,
            docs_cloned = marker.docs_cloned,
            mods_applied = marker.mods_applied,
            last_applied_seq = marker.last_applied_seq,
            "Range cloned"
        );
        Ok(marker)
    }

    /// Apply every outstanding change. Runs while the donor blocks writes to
    /// the range, so the set of changes is finite.
    pub async fn drain_remaining(
        &self,
        request: &CloneRequest<'_>,
        marker: &mut ClonedMarker,
        progress: &CloneProgress,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_generation(request, deadline, cancel).await?;
        while self
            .apply_batch(request, marker, progress, deadline, cancel)
            .await?
            > 0
        {}
        debug!(
            migration_id = %request.migration_id,
            last_applied_seq = marker.last_applied_seq,
            "Drained remaining changes"
        );
        Ok(())
    }

    /// Replay one batch of donor changes; returns how many were applied
    async fn apply_batch(
        &self,
        request: &CloneRequest<'_>,
        marker: &mut ClonedMarker,
        progress: &CloneProgress,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let donor: &dyn ShardStore = request.donor.store().as_ref();
        let recipient: &dyn ShardStore = request.recipient.store().as_ref();
        let namespace = request.namespace;
        let range = request.range;
        let since = marker.last_applied_seq;
        let batch_size = self.config.clone_batch_size;

        let changes = self
            .with_retry("read donor changes", deadline, cancel, move || {
                donor.changes_since(namespace, range, since, batch_size)
            })
            .await?;
        let Some(last_seq) = changes.last().map(|c| c.seq) else {
            return Ok(0);
        };

        let applied = self
            .with_retry("apply changes to recipient", deadline, cancel, move || {
                recipient.apply_changes(namespace, changes.clone())
            })
            .await?;
        marker.mods_applied += applied;
        marker.last_applied_seq = last_seq;
        progress.add_mods(applied);
        Ok(applied)
    }

    /// Both shards must still hold the generation the migration started with
    async fn check_generation(
        &self,
        request: &CloneRequest<'_>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for shard in [request.donor, request.recipient] {
            let store: &dyn ShardStore = shard.store().as_ref();
            let namespace = request.namespace;
            let uuid = self
                .with_retry("check collection generation", deadline, cancel, move || {
                    store.collection_uuid(namespace)
                })
                .await?;
            match uuid {
                Some(uuid) if uuid == request.collection_uuid => {}
                Some(uuid) => {
                    return Err(Error::ClonerAborted(format!(
                        "{} on {} was recreated (uuid {} != {})",
                        namespace,
                        shard.id(),
                        uuid,
                        request.collection_uuid
                    )))
                }
                None => {
                    return Err(Error::ClonerAborted(format!(
                        "{} no longer exists on {}",
                        namespace,
                        shard.id()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    ///
    /// Gives up with `ClonerAborted` when the collection is gone, when
    /// `clone_max_attempts` consecutive attempts failed, when `deadline`
    /// passes, or when `cancel` fires.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Instant,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let now = Instant::now();
            if cancel.is_cancelled() {
                return Err(Error::ClonerAborted(format!("{}: cancelled", operation)));
            }
            if now >= deadline {
                return Err(self.timed_out(operation));
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::ClonerAborted(format!("{}: cancelled", operation)));
                }
                result = tokio::time::timeout(deadline - now, op()) => result,
            };

            let error = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => return Err(self.timed_out(operation)),
            };
            match error {
                Error::NamespaceNotFound(_)
                | Error::CollectionUuidMismatch { .. }
                | Error::ChangeLogTruncated { .. } => {
                    return Err(Error::ClonerAborted(format!("{}: {}", operation, error)))
                }
                e if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.clone_max_attempts {
                        return Err(Error::ClonerAborted(format!(
                            "{} failed after {} attempts: {}",
                            operation, attempt, e
                        )));
                    }
                    let backoff = self.config.clone_backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient cloner failure, retrying"
                    );
                    telemetry::record_clone_retry(operation);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                e => return Err(e),
            }
        }
    }

    fn timed_out(&self, operation: &'static str) -> Error {
        Error::ClonerAborted(format!(
            "{}: clone did not finish within {:?}",
            operation, self.config.clone_timeout
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::BoundedClock;
    use crate::durable::ObjectStoreLog;
    use crate::range_deleter::{RangeDeleterConfig, StalenessTimerFence};
    use crate::routing::{ChunkOwnership, LocalRoutingCatalog, RoutingCatalog};
    use crate::shard::{Document, MemoryShardStore, ShardParts};
    use object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn pair(uuid: Uuid) -> (Arc<Shard>, Arc<Shard>) {
        pair_with_change_log(uuid, MemoryShardStore::DEFAULT_CHANGE_LOG_CAPACITY).await
    }

    async fn pair_with_change_log(uuid: Uuid, capacity: usize) -> (Arc<Shard>, Arc<Shard>) {
        let catalog = Arc::new(LocalRoutingCatalog::new());
        catalog
            .create_collection(
                "db.c",
                uuid,
                vec![ChunkOwnership::new(KeyRange::from_u64(0, 1000), "a")],
            )
            .await
            .unwrap();
        let build = |id: &str| {
            let clock = Arc::new(BoundedClock::new(Duration::ZERO));
            Shard::new(
                id,
                ShardParts {
                    store: Arc::new(MemoryShardStore::with_change_log_capacity(capacity)),
                    log: Arc::new(ObjectStoreLog::for_shard(
                        Arc::new(InMemory::new()),
                        id,
                        clock.clone(),
                    )),
                    catalog: catalog.clone(),
                    fence: Arc::new(StalenessTimerFence::new(Duration::ZERO)),
                    clock,
                    deleter_config: RangeDeleterConfig::default(),
                },
            )
        };
        let (donor, recipient) = (build("a"), build("b"));
        donor.store().create_collection("db.c", uuid).await.unwrap();
        recipient.store().create_collection("db.c", uuid).await.unwrap();
        (donor, recipient)
    }

    fn config() -> MigrationConfig {
        MigrationConfig {
            clone_batch_size: 7,
            max_catchup_lag: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clone_copies_only_the_range() {
        let uuid = Uuid::new_v4();
        let (donor, recipient) = pair(uuid).await;
        for i in 0..50u64 {
            donor.write("db.c", Document::new(i, json!({ "i": i }))).await.unwrap();
        }
        let range = KeyRange::from_u64(10, 30);
        let request = CloneRequest {
            migration_id: MigrationId::new(),
            namespace: "db.c",
            collection_uuid: uuid,
            range: &range,
            donor: &donor,
            recipient: &recipient,
        };
        let progress = CloneProgress::new();

        let marker = RangeCloner::new(config())
            .clone_range(&request, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(marker.docs_cloned, 20);
        assert_eq!(progress.docs_cloned(), 20);
        assert_eq!(recipient.store().count_in_range("db.c", &range).await.unwrap(), 20);
        assert_eq!(
            recipient
                .store()
                .count_in_range("db.c", &KeyRange::from_u64(0, 1000))
                .await
                .unwrap(),
            20
        );
    }

    #[tokio::test]
    async fn test_drain_replays_writes_made_after_the_scan() {
        let uuid = Uuid::new_v4();
        let (donor, recipient) = pair(uuid).await;
        for i in 0..10u64 {
            donor.write("db.c", Document::new(i, json!({ "v": 0 }))).await.unwrap();
        }
        let range = KeyRange::from_u64(0, 10);
        let request = CloneRequest {
            migration_id: MigrationId::new(),
            namespace: "db.c",
            collection_uuid: uuid,
            range: &range,
            donor: &donor,
            recipient: &recipient,
        };
        let cloner = RangeCloner::new(MigrationConfig {
            max_catchup_lag: 100,
            ..config()
        });
        let progress = CloneProgress::new();
        let cancel = CancellationToken::new();
        let mut marker = cloner.clone_range(&request, &progress, &cancel).await.unwrap();

        donor.write("db.c", Document::new(3u64, json!({ "v": 1 }))).await.unwrap();
        donor.remove("db.c", &ShardKey::from_u64(4)).await.unwrap();
        cloner
            .drain_remaining(
                &request,
                &mut marker,
                &progress,
                Instant::now() + Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(marker.mods_applied, 2);
        let doc = recipient
            .store()
            .get("db.c", &ShardKey::from_u64(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.body, json!({ "v": 1 }));
        assert!(recipient
            .store()
            .get("db.c", &ShardKey::from_u64(4))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_drain_aborts_when_change_log_moved_past_it() {
        let uuid = Uuid::new_v4();
        let (donor, recipient) = pair_with_change_log(uuid, 4).await;
        for i in 0..10u64 {
            donor.write("db.c", Document::new(i, json!({ "v": 0 }))).await.unwrap();
        }
        let range = KeyRange::from_u64(0, 10);
        let request = CloneRequest {
            migration_id: MigrationId::new(),
            namespace: "db.c",
            collection_uuid: uuid,
            range: &range,
            donor: &donor,
            recipient: &recipient,
        };
        let cloner = RangeCloner::new(config());
        let progress = CloneProgress::new();
        let cancel = CancellationToken::new();
        let mut marker = cloner.clone_range(&request, &progress, &cancel).await.unwrap();

        for i in 0..10u64 {
            donor.write("db.c", Document::new(i, json!({ "v": 1 }))).await.unwrap();
        }
        match cloner
            .drain_remaining(
                &request,
                &mut marker,
                &progress,
                Instant::now() + Duration::from_secs(5),
                &cancel,
            )
            .await
        {
            Err(Error::ClonerAborted(msg)) => assert!(msg.contains("truncated"), "{}", msg),
            other => panic!("Expected ClonerAborted, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recreated_collection_aborts_clone() {
        let uuid = Uuid::new_v4();
        let (donor, recipient) = pair(uuid).await;
        donor.store().drop_collection("db.c").await.unwrap();
        donor.store().create_collection("db.c", Uuid::new_v4()).await.unwrap();

        let range = KeyRange::from_u64(0, 10);
        let request = CloneRequest {
            migration_id: MigrationId::new(),
            namespace: "db.c",
            collection_uuid: uuid,
            range: &range,
            donor: &donor,
            recipient: &recipient,
        };
        match RangeCloner::new(config())
            .clone_range(&request, &CloneProgress::new(), &CancellationToken::new())
            .await
        {
            Err(Error::ClonerAborted(msg)) => assert!(msg.contains("recreated"), "{}", msg),
            other => panic!("Expected ClonerAborted, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_clone_aborts() {
        let uuid = Uuid::new_v4();
        let (donor, recipient) = pair(uuid).await;
        let range = KeyRange::from_u64(0, 10);
        let request = CloneRequest {
            migration_id: MigrationId::new(),
            namespace: "db.c",
            collection_uuid: uuid,
            range: &range,
            donor: &donor,
            recipient: &recipient,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = RangeCloner::new(config())
            .clone_range(&request, &CloneProgress::new(), &cancel)
            .await;
        assert!(matches!(result, Err(Error::ClonerAborted(_))));
    }
}
