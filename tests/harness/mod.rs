//! Test harness for rangemover integration tests
//!
//! Builds an in-process cluster of shards that share one object store and
//! routing catalog, plus wrappers that inject the failures migrations must
//! survive: lost catalog responses, durable log outages and slow donors.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use rangemover::clock::BoundedClock;
use rangemover::durable::{DocumentKind, DurableLog, LogEntry, LogPosition, ObjectStoreLog};
use rangemover::migration::{
    MigrationConfig, MigrationId, MigrationManager, MigrationRequest, RecoveryManager,
};
use rangemover::range_deleter::{RangeDeleterConfig, StalenessTimerFence, VisibilityFence};
use rangemover::routing::{
    ChunkOwnership, CollectionRouting, KeyRange, LocalRoutingCatalog, MigrationOutcome,
    ReassignOutcome, ReassignRequest, RoutingCatalog, ShardKey,
};
use rangemover::shard::{
    ChangeRecord, Document, MemoryShardStore, Shard, ShardDirectory, ShardParts, ShardStore,
};
use rangemover::{Error, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const NAMESPACE: &str = "app.orders";

/// Migration settings that keep failing tests fast
pub fn test_migration_config() -> MigrationConfig {
    MigrationConfig {
        clone_batch_size: 64,
        clone_retry_backoff: Duration::from_millis(1),
        commit_timeout: Duration::from_secs(2),
        overlapping_deletion_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

pub fn test_deleter_config() -> RangeDeleterConfig {
    RangeDeleterConfig {
        batch_size: 64,
        batch_delay: Duration::ZERO,
        tick_interval: Duration::from_millis(10),
        retry_base_backoff: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Keys strictly between `from_u64(k)` and `from_u64(k + 1)`, so many
/// documents fit inside a small integer range
pub fn dense_key(k: u64, suffix: u8) -> ShardKey {
    let mut bytes = k.to_be_bytes().to_vec();
    bytes.push(suffix);
    ShardKey::new(bytes)
}

/// Shards sharing one object store, one routing catalog and one namespace.
/// The first shard initially owns the whole key space.
pub struct Cluster {
    pub object_store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn RoutingCatalog>,
    pub directory: Arc<ShardDirectory>,
    pub stores: BTreeMap<String, Arc<dyn ShardStore>>,
    pub collection_uuid: Uuid,
    pub migration: MigrationConfig,
    pub deleter: RangeDeleterConfig,
}

impl Cluster {
    pub async fn new(shards: &[&str]) -> Self {
        Self::with_catalog(Arc::new(LocalRoutingCatalog::new()), shards).await
    }

    pub async fn with_catalog(catalog: Arc<dyn RoutingCatalog>, shards: &[&str]) -> Self {
        let stores = shards
            .iter()
            .map(|id| (*id, Arc::new(MemoryShardStore::new()) as Arc<dyn ShardStore>))
            .collect();
        Self::with_stores(catalog, stores).await
    }

    pub async fn with_stores(
        catalog: Arc<dyn RoutingCatalog>,
        stores: Vec<(&str, Arc<dyn ShardStore>)>,
    ) -> Self {
        let collection_uuid = Uuid::new_v4();
        let first = stores[0].0;
        catalog
            .create_collection(
                NAMESPACE,
                collection_uuid,
                vec![ChunkOwnership::new(
                    KeyRange::from_u64(0, u64::MAX),
                    first,
                )],
            )
            .await
            .unwrap();

        let mut cluster = Self {
            object_store: Arc::new(InMemory::new()),
            catalog,
            directory: Arc::new(ShardDirectory::new()),
            stores: BTreeMap::new(),
            collection_uuid,
            migration: test_migration_config(),
            deleter: test_deleter_config(),
        };
        for (id, store) in stores {
            store
                .create_collection(NAMESPACE, collection_uuid)
                .await
                .unwrap();
            cluster.stores.insert(id.to_string(), store);
            let log = cluster.log_for(id);
            cluster.start_shard(id, log);
        }
        cluster
    }

    /// Durable log of `id` as a fresh process would open it
    pub fn log_for(&self, id: &str) -> Arc<dyn DurableLog> {
        Arc::new(ObjectStoreLog::for_shard(
            self.object_store.clone(),
            id,
            Arc::new(BoundedClock::new(Duration::ZERO)),
        ))
    }

    /// (Re)start a shard process over its existing storage engine
    pub fn start_shard(&self, id: &str, log: Arc<dyn DurableLog>) -> Arc<Shard> {
        self.start_shard_with_fence(id, log, Arc::new(StalenessTimerFence::new(Duration::ZERO)))
    }

    pub fn start_shard_with_fence(
        &self,
        id: &str,
        log: Arc<dyn DurableLog>,
        fence: Arc<dyn VisibilityFence>,
    ) -> Arc<Shard> {
        let shard = Shard::new(
            id,
            ShardParts {
                store: self.stores[id].clone(),
                log,
                catalog: self.catalog.clone(),
                fence,
                clock: Arc::new(BoundedClock::new(Duration::ZERO)),
                deleter_config: self.deleter.clone(),
            },
        );
        self.directory.insert(shard.clone());
        shard
    }

    pub fn shard(&self, id: &str) -> Arc<Shard> {
        self.directory.get(id).unwrap()
    }

    pub fn manager(&self) -> MigrationManager {
        MigrationManager::new(
            self.migration.clone(),
            self.catalog.clone(),
            self.directory.clone(),
        )
    }

    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(
            self.migration.clone(),
            self.catalog.clone(),
            self.directory.clone(),
        )
    }

    pub fn request(&self, range: KeyRange, donor: &str, recipient: &str) -> MigrationRequest {
        MigrationRequest {
            namespace: NAMESPACE.to_string(),
            range,
            donor: donor.to_string(),
            recipient: recipient.to_string(),
        }
    }

    /// Write documents straight into a shard's storage engine
    pub async fn seed(&self, id: &str, keys: impl IntoIterator<Item = ShardKey>) {
        let documents: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let label = key.to_string();
                Document::new(key, json!({ "key": label }))
            })
            .collect();
        self.stores[id]
            .upsert_batch(NAMESPACE, documents)
            .await
            .unwrap();
    }

    pub async fn count(&self, id: &str, range: &KeyRange) -> u64 {
        self.stores[id].count_in_range(NAMESPACE, range).await.unwrap()
    }

    pub async fn routing(&self) -> CollectionRouting {
        self.catalog.get_collection(NAMESPACE).await.unwrap().unwrap()
    }

    /// Tick every shard's range deleter until nothing is outstanding
    pub async fn drain_deleters(&self) {
        for id in self.directory.ids() {
            self.shard(&id)
                .range_deleter()
                .run_until_idle(Duration::from_secs(10))
                .await
                .unwrap();
        }
    }
}

/// Catalog whose ownership transaction response never reaches the caller
pub struct LostResponseCatalog {
    inner: LocalRoutingCatalog,
    /// Apply the transaction before losing the response
    apply: bool,
    lost: AtomicUsize,
}

impl LostResponseCatalog {
    /// Commit lands, response is lost
    pub fn applied() -> Self {
        Self {
            inner: LocalRoutingCatalog::new(),
            apply: true,
            lost: AtomicUsize::new(0),
        }
    }

    /// Request is lost before reaching the catalog
    pub fn dropped() -> Self {
        Self {
            inner: LocalRoutingCatalog::new(),
            apply: false,
            lost: AtomicUsize::new(0),
        }
    }

    pub fn lost_responses(&self) -> usize {
        self.lost.load(Ordering::SeqCst)
    }

    /// Deliver a late copy of the transaction, as a retried network packet would
    pub async fn deliver_late(&self, request: &ReassignRequest) -> Result<ReassignOutcome> {
        self.inner.conditional_reassign_range(request).await
    }
}

#[async_trait]
impl RoutingCatalog for LostResponseCatalog {
    async fn create_collection(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        chunks: Vec<ChunkOwnership>,
    ) -> Result<CollectionRouting> {
        self.inner
            .create_collection(namespace, collection_uuid, chunks)
            .await
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        self.inner.drop_collection(namespace).await
    }

    async fn get_collection(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        self.inner.get_collection(namespace).await
    }

    async fn conditional_reassign_range(
        &self,
        request: &ReassignRequest,
    ) -> Result<ReassignOutcome> {
        if self.apply {
            self.inner.conditional_reassign_range(request).await?;
        }
        self.lost.fetch_add(1, Ordering::SeqCst);
        Err(Error::Storage("connection reset by peer".to_string()))
    }

    async fn lookup_migration_outcome(
        &self,
        migration_id: MigrationId,
    ) -> Result<MigrationOutcome> {
        self.inner.lookup_migration_outcome(migration_id).await
    }

    async fn abort_migration(&self, migration_id: MigrationId) -> Result<MigrationOutcome> {
        self.inner.abort_migration(migration_id).await
    }
}

/// Catalog whose ownership transaction stalls for `hang` before reaching it
pub struct HangingCatalog {
    inner: LocalRoutingCatalog,
    hang: Duration,
}

impl HangingCatalog {
    pub fn new(hang: Duration) -> Self {
        Self {
            inner: LocalRoutingCatalog::new(),
            hang,
        }
    }
}

#[async_trait]
impl RoutingCatalog for HangingCatalog {
    async fn create_collection(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        chunks: Vec<ChunkOwnership>,
    ) -> Result<CollectionRouting> {
        self.inner
            .create_collection(namespace, collection_uuid, chunks)
            .await
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        self.inner.drop_collection(namespace).await
    }

    async fn get_collection(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        self.inner.get_collection(namespace).await
    }

    async fn conditional_reassign_range(
        &self,
        request: &ReassignRequest,
    ) -> Result<ReassignOutcome> {
        tokio::time::sleep(self.hang).await;
        self.inner.conditional_reassign_range(request).await
    }

    async fn lookup_migration_outcome(
        &self,
        migration_id: MigrationId,
    ) -> Result<MigrationOutcome> {
        self.inner.lookup_migration_outcome(migration_id).await
    }

    async fn abort_migration(&self, migration_id: MigrationId) -> Result<MigrationOutcome> {
        self.inner.abort_migration(migration_id).await
    }
}

/// Durable log that loses its disk after `healthy_writes` coordinator writes
pub struct FlakyLog {
    inner: Arc<dyn DurableLog>,
    healthy_writes: usize,
    migration_writes: AtomicUsize,
}

impl FlakyLog {
    pub fn new(inner: Arc<dyn DurableLog>, healthy_writes: usize) -> Self {
        Self {
            inner,
            healthy_writes,
            migration_writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DurableLog for FlakyLog {
    async fn append_durable(
        &self,
        kind: DocumentKind,
        key: &str,
        document: Bytes,
    ) -> Result<LogPosition> {
        if kind == DocumentKind::Migrations
            && self.migration_writes.fetch_add(1, Ordering::SeqCst) >= self.healthy_writes
        {
            return Err(Error::Storage("injected log failure".to_string()));
        }
        self.inner.append_durable(kind, key, document).await
    }

    async fn read(&self, kind: DocumentKind, key: &str) -> Result<Option<Bytes>> {
        self.inner.read(kind, key).await
    }

    async fn read_all_pending(&self, kind: DocumentKind) -> Result<Vec<LogEntry>> {
        self.inner.read_all_pending(kind).await
    }

    async fn remove_durable(&self, kind: DocumentKind, key: &str) -> Result<LogPosition> {
        self.inner.remove_durable(kind, key).await
    }
}

/// Storage engine whose range scans and change log reads stall while `slow` is set
pub struct SlowDonorStore {
    inner: MemoryShardStore,
    delay: Duration,
    slow: AtomicBool,
}

impl SlowDonorStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryShardStore::new(),
            delay,
            slow: AtomicBool::new(false),
        }
    }

    pub fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShardStore for SlowDonorStore {
    async fn create_collection(&self, namespace: &str, collection_uuid: Uuid) -> Result<()> {
        self.inner.create_collection(namespace, collection_uuid).await
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        self.inner.drop_collection(namespace).await
    }

    async fn collection_uuid(&self, namespace: &str) -> Result<Option<Uuid>> {
        self.inner.collection_uuid(namespace).await
    }

    async fn upsert(&self, namespace: &str, document: Document) -> Result<u64> {
        self.inner.upsert(namespace, document).await
    }

    async fn upsert_batch(&self, namespace: &str, documents: Vec<Document>) -> Result<u64> {
        self.inner.upsert_batch(namespace, documents).await
    }

    async fn delete(&self, namespace: &str, key: &ShardKey) -> Result<u64> {
        self.inner.delete(namespace, key).await
    }

    async fn get(&self, namespace: &str, key: &ShardKey) -> Result<Option<Document>> {
        self.inner.get(namespace, key).await
    }

    async fn scan_range(
        &self,
        namespace: &str,
        range: &KeyRange,
        after: Option<&ShardKey>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.scan_range(namespace, range, after, limit).await
    }

    async fn latest_seq(&self) -> Result<u64> {
        self.inner.latest_seq().await
    }

    async fn changes_since(
        &self,
        namespace: &str,
        range: &KeyRange,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.changes_since(namespace, range, since, limit).await
    }

    async fn count_changes_since(
        &self,
        namespace: &str,
        range: &KeyRange,
        since: u64,
    ) -> Result<u64> {
        self.inner.count_changes_since(namespace, range, since).await
    }

    async fn apply_changes(&self, namespace: &str, changes: Vec<ChangeRecord>) -> Result<u64> {
        self.inner.apply_changes(namespace, changes).await
    }

    async fn delete_range_batch(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        range: &KeyRange,
        limit: usize,
    ) -> Result<u64> {
        self.inner
            .delete_range_batch(namespace, collection_uuid, range, limit)
            .await
    }

    async fn count_in_range(&self, namespace: &str, range: &KeyRange) -> Result<u64> {
        self.inner.count_in_range(namespace, range).await
    }
}
