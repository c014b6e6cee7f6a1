//! Routing catalog trait

use super::{
    ChunkOwnership, CollectionRouting, Epoch, KeyRange, MigrationOutcome, ReassignOutcome,
    ShardId, ShardKey,
};
use crate::migration::MigrationId;
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Arguments of a conditional ownership transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassignRequest {
    pub namespace: String,
    /// Generation the migration was started against; a recreated
    /// namespace with the same name is treated as dropped
    pub collection_uuid: Uuid,
    pub range: KeyRange,
    pub from: ShardId,
    pub to: ShardId,
    pub expected_epoch: Epoch,
    pub migration_id: MigrationId,
}

/// Routing catalog interface
///
/// Abstracts the authoritative metadata store so the migration protocol
/// runs unchanged against the in-memory catalog (tests, single process)
/// and the object-store catalog (durable, multi-process).
#[async_trait]
pub trait RoutingCatalog: Send + Sync {
    /// Register a namespace with its initial chunk layout
    async fn create_collection(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        chunks: Vec<ChunkOwnership>,
    ) -> Result<CollectionRouting>;

    /// Remove a namespace's routing table
    async fn drop_collection(&self, namespace: &str) -> Result<()>;

    /// Fetch a fresh copy of a namespace's routing table
    async fn get_collection(&self, namespace: &str) -> Result<Option<CollectionRouting>>;

    /// Atomically move `range` from `from` to `to` if the epoch still matches.
    /// Retrying with the same migration id never applies the change twice.
    async fn conditional_reassign_range(&self, request: &ReassignRequest)
        -> Result<ReassignOutcome>;

    /// Outcome recorded for a migration id, or `Unknown` if none was recorded
    async fn lookup_migration_outcome(&self, migration_id: MigrationId)
        -> Result<MigrationOutcome>;

    /// Record an abort for a migration id so a delayed commit with the same
    /// id can never apply. Returns the outcome now in force.
    async fn abort_migration(&self, migration_id: MigrationId) -> Result<MigrationOutcome>;

    /// Current owner of a key and the epoch that ownership was read at
    async fn owner_of(&self, namespace: &str, key: &ShardKey) -> Result<Option<(ShardId, Epoch)>> {
        Ok(self.get_collection(namespace).await?.and_then(|routing| {
            routing
                .owner_for(key)
                .map(|chunk| (chunk.owner.clone(), routing.epoch))
        }))
    }
}
