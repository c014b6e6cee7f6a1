//! Local in-memory routing catalog for development and testing

use super::{
    CatalogState, ChunkOwnership, CollectionRouting, MigrationOutcome, ReassignOutcome,
    ReassignRequest, RoutingCatalog,
};
use crate::migration::MigrationId;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Local in-memory routing catalog
///
/// All mutations take the write lock, so every reassignment is atomic with
/// respect to readers and to the outcome records.
#[derive(Debug, Default)]
pub struct LocalRoutingCatalog {
    state: RwLock<CatalogState>,
}

impl LocalRoutingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the whole catalog, for inspection in tests and tooling
    pub fn snapshot(&self) -> CatalogState {
        self.state.read().clone()
    }
}

#[async_trait]
impl RoutingCatalog for LocalRoutingCatalog {
    async fn create_collection(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        chunks: Vec<ChunkOwnership>,
    ) -> Result<CollectionRouting> {
        let routing = self
            .state
            .write()
            .create_collection(namespace, collection_uuid, chunks)?;
        info!(namespace, %collection_uuid, "Registered collection routing");
        Ok(routing)
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        if self.state.write().drop_collection(namespace) {
            info!(namespace, "Dropped collection routing");
        }
        Ok(())
    }

    async fn get_collection(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        Ok(self.state.read().collections.get(namespace).cloned())
    }

    async fn conditional_reassign_range(
        &self,
        request: &ReassignRequest,
    ) -> Result<ReassignOutcome> {
        let (outcome, _) = self.state.write().reassign(request);
        debug!(
            migration_id = %request.migration_id,
            namespace = %request.namespace,
            range = %request.range,
            ?outcome,
            "Conditional reassign"
        );
        Ok(outcome)
    }

    async fn lookup_migration_outcome(
        &self,
        migration_id: MigrationId,
    ) -> Result<MigrationOutcome> {
        Ok(self.state.read().lookup(migration_id))
    }

    async fn abort_migration(&self, migration_id: MigrationId) -> Result<MigrationOutcome> {
        let (outcome, _) = self.state.write().abort(migration_id);
        Ok(outcome)
    }
}
