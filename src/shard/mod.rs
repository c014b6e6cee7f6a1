//! Shard-local storage and the write admission path
//!
//! A [`Shard`] bundles the storage engine, the durable log, the critical
//! section registry, and the range deletion scheduler of one node group.
//! Every write is admitted under a shared lock and re-checks ownership
//! against the routing catalog, so once a migration commits the donor
//! refuses writes for the moved range instead of accepting orphans.

mod critical_section;
mod memory;

pub use critical_section::{
    CriticalSectionGuard, CriticalSectionRegistry, SectionRelease, SectionWaiter,
};
pub use memory::MemoryShardStore;

use crate::clock::BoundedClock;
use crate::durable::DurableLog;
use crate::range_deleter::{RangeDeleterConfig, RangeDeletionScheduler, VisibilityFence};
use crate::routing::{KeyRange, RoutingCatalog, ShardId, ShardKey};
use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: ShardKey,
    pub body: serde_json::Value,
}

impl Document {
    pub fn new(key: impl Into<ShardKey>, body: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }
}

/// Kind of change captured in the shard change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeOp {
    Upsert(serde_json::Value),
    Delete,
}

/// One entry of the shard change log, used for catch-up cloning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub namespace: String,
    pub key: ShardKey,
    pub op: ChangeOp,
}

/// Storage engine interface of a shard
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Create a namespace with the given generation; idempotent for the same UUID
    async fn create_collection(&self, namespace: &str, collection_uuid: Uuid) -> Result<()>;

    /// Drop a namespace and all its documents
    async fn drop_collection(&self, namespace: &str) -> Result<()>;

    /// Generation of a namespace, or `None` if it does not exist here
    async fn collection_uuid(&self, namespace: &str) -> Result<Option<Uuid>>;

    /// Insert or replace one document; returns the change sequence number
    async fn upsert(&self, namespace: &str, document: Document) -> Result<u64>;

    /// Insert or replace documents in order; returns how many were written
    async fn upsert_batch(&self, namespace: &str, documents: Vec<Document>) -> Result<u64>;

    /// Delete one document; returns the change sequence number
    async fn delete(&self, namespace: &str, key: &ShardKey) -> Result<u64>;

    async fn get(&self, namespace: &str, key: &ShardKey) -> Result<Option<Document>>;

    /// Documents in `range` with key strictly greater than `after`, in key order
    async fn scan_range(
        &self,
        namespace: &str,
        range: &KeyRange,
        after: Option<&ShardKey>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Highest change sequence number issued so far
    async fn latest_seq(&self) -> Result<u64>;

    /// Changes to `range` with sequence number greater than `since`, in order
    async fn changes_since(
        &self,
        namespace: &str,
        range: &KeyRange,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>>;

    /// Number of changes to `range` with sequence number greater than `since`
    async fn count_changes_since(&self, namespace: &str, range: &KeyRange, since: u64)
        -> Result<u64>;

    /// Replay captured changes
    async fn apply_changes(&self, namespace: &str, changes: Vec<ChangeRecord>) -> Result<u64>;

    /// Delete up to `limit` documents in `range`, only if the namespace still
    /// has generation `collection_uuid`. Returns the number deleted.
    async fn delete_range_batch(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        range: &KeyRange,
        limit: usize,
    ) -> Result<u64>;

    async fn count_in_range(&self, namespace: &str, range: &KeyRange) -> Result<u64>;
}

/// Components a shard is assembled from
pub struct ShardParts {
    pub store: Arc<dyn ShardStore>,
    pub log: Arc<dyn DurableLog>,
    pub catalog: Arc<dyn RoutingCatalog>,
    pub fence: Arc<dyn VisibilityFence>,
    pub clock: Arc<BoundedClock>,
    pub deleter_config: RangeDeleterConfig,
}

/// One node group: storage plus the migration-related per-shard services
pub struct Shard {
    id: ShardId,
    store: Arc<dyn ShardStore>,
    log: Arc<dyn DurableLog>,
    catalog: Arc<dyn RoutingCatalog>,
    clock: Arc<BoundedClock>,
    critical_sections: Arc<CriticalSectionRegistry>,
    range_deleter: Arc<RangeDeletionScheduler>,
    /// Writes hold this shared while checking sections and ownership;
    /// entering a critical section takes it exclusively
    admission: RwLock<()>,
}

impl Shard {
    pub fn new(id: impl Into<ShardId>, parts: ShardParts) -> Arc<Self> {
        let id = id.into();
        let range_deleter = Arc::new(RangeDeletionScheduler::new(
            id.clone(),
            parts.deleter_config,
            parts.store.clone(),
            parts.log.clone(),
            parts.catalog.clone(),
            parts.fence,
            parts.clock.clone(),
        ));
        Arc::new(Self {
            id,
            store: parts.store,
            log: parts.log,
            catalog: parts.catalog,
            clock: parts.clock,
            critical_sections: Arc::new(CriticalSectionRegistry::new()),
            range_deleter,
            admission: RwLock::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<dyn ShardStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn clock(&self) -> &Arc<BoundedClock> {
        &self.clock
    }

    pub fn range_deleter(&self) -> &Arc<RangeDeletionScheduler> {
        &self.range_deleter
    }

    pub fn critical_sections(&self) -> &Arc<CriticalSectionRegistry> {
        &self.critical_sections
    }

    /// Block writes to `range`. Writes already admitted finish first, so
    /// every write not blocked is visible to the final catch-up drain.
    pub async fn enter_critical_section(
        &self,
        namespace: &str,
        range: &KeyRange,
        queue_limit: usize,
    ) -> Result<CriticalSectionGuard> {
        let _admission = self.admission.write().await;
        self.critical_sections.enter(namespace, range, queue_limit)
    }

    /// Insert or replace a document this shard owns
    pub async fn write(&self, namespace: &str, document: Document) -> Result<u64> {
        loop {
            let waiter = {
                let _admission = self.admission.read().await;
                match self.critical_sections.waiter_for(namespace, &document.key)? {
                    Some(waiter) => waiter,
                    None => {
                        self.check_ownership(namespace, &document.key).await?;
                        return self.store.upsert(namespace, document).await;
                    }
                }
            };
            let release = waiter.wait().await;
            debug!(shard = %self.id, namespace, ?release, "Write resumed after critical section");
        }
    }

    /// Delete a document this shard owns
    pub async fn remove(&self, namespace: &str, key: &ShardKey) -> Result<u64> {
        loop {
            let waiter = {
                let _admission = self.admission.read().await;
                match self.critical_sections.waiter_for(namespace, key)? {
                    Some(waiter) => waiter,
                    None => {
                        self.check_ownership(namespace, key).await?;
                        return self.store.delete(namespace, key).await;
                    }
                }
            };
            waiter.wait().await;
        }
    }

    async fn check_ownership(&self, namespace: &str, key: &ShardKey) -> Result<()> {
        match self.catalog.owner_of(namespace, key).await? {
            None => Err(Error::NamespaceNotFound(namespace.to_string())),
            Some((owner, _)) if owner == self.id => Ok(()),
            Some((owner, epoch)) => Err(Error::ShardMoved {
                new_location: owner,
                epoch,
            }),
        }
    }
}

/// Shards reachable from this process
#[derive(Default)]
pub struct ShardDirectory {
    shards: DashMap<ShardId, Arc<Shard>>,
}

impl ShardDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard, replacing any previous handle with the same id
    pub fn insert(&self, shard: Arc<Shard>) {
        self.shards.insert(shard.id().to_string(), shard);
    }

    pub fn get(&self, id: &str) -> Result<Arc<Shard>> {
        self.shards
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ShardNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.shards.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
