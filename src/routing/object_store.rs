//! Object-store routing catalog for multi-process deployment
//!
//! The whole catalog (routing tables plus migration outcome records) lives in
//! a single object updated with ETag compare-and-swap, so an ownership change
//! and the outcome record for its migration id become visible together.

use super::{
    CatalogState, ChunkOwnership, CollectionRouting, MigrationOutcome, ReassignOutcome,
    ReassignRequest, RoutingCatalog,
};
use crate::migration::MigrationId;
use crate::{Error, Result};

use async_trait::async_trait;
use metrics::{counter, histogram};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum number of CAS retries for atomic operations
const MAX_CAS_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds for exponential backoff
const BASE_BACKOFF_MS: u64 = 100;

/// CAS retry loop with exponential backoff on conflict.
///
/// The body is an async block performing one load-modify-save cycle.
/// Return `Ok(value)` on success, `Err(Error::Conflict)` to trigger retry,
/// or any other `Err` to abort immediately.
macro_rules! cas_retry {
    ($operation:expr, $body:block) => {{
        let mut __cas_result = Err(Error::TooManyRetries);
        for __cas_attempt in 0..MAX_CAS_RETRIES {
            match (async $body).await {
                Ok(value) => {
                    __cas_result = Ok(value);
                    break;
                }
                Err(Error::Conflict) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(__cas_attempt);
                    counter!("rangemover_catalog_cas_retries_total", "operation" => $operation)
                        .increment(1);
                    debug!(
                        "CAS conflict on {} attempt {}, retrying after {}ms",
                        $operation,
                        __cas_attempt + 1,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    __cas_result = Err(e);
                    break;
                }
            }
        }
        __cas_result
    }};
}

/// Object-store catalog configuration
#[derive(Debug, Clone)]
pub struct ObjectStoreRoutingConfig {
    /// Prefix for the catalog object
    pub prefix: String,
    /// Allow explicit fallback to unsafe overwrite when CAS update is not supported
    pub allow_unsafe_overwrite: bool,
}

impl Default for ObjectStoreRoutingConfig {
    fn default() -> Self {
        Self {
            prefix: "routing/".to_string(),
            allow_unsafe_overwrite: false,
        }
    }
}

/// Durable routing catalog on top of any `ObjectStore`
pub struct ObjectStoreRoutingCatalog {
    object_store: Arc<dyn ObjectStore>,
    config: ObjectStoreRoutingConfig,
}

impl ObjectStoreRoutingCatalog {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: ObjectStoreRoutingConfig) -> Self {
        Self {
            object_store,
            config,
        }
    }

    fn catalog_path(&self) -> Path {
        Path::from(self.config.prefix.as_str()).child("catalog.json")
    }

    /// Load the catalog with its ETag. A missing object is an empty catalog
    /// with the sentinel ETag `none`, so the first write uses `PutMode::Create`.
    async fn load_with_etag(&self) -> Result<(CatalogState, String)> {
        let path = self.catalog_path();
        match self.object_store.get(&path).await {
            Ok(result) => {
                let e_tag = result
                    .meta
                    .e_tag
                    .clone()
                    .unwrap_or_else(|| "no-etag".to_string());
                let bytes = result.bytes().await?;
                if bytes.is_empty() {
                    return Ok((CatalogState::default(), e_tag));
                }
                let state: CatalogState = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Serialization(format!("Corrupt routing catalog: {}", e)))?;
                Ok((state, e_tag))
            }
            Err(object_store::Error::NotFound { .. }) => {
                debug!("No routing catalog found, starting fresh");
                Ok((CatalogState::default(), "none".to_string()))
            }
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }

    async fn save_with_cas(
        &self,
        state: &CatalogState,
        expected_etag: &str,
        operation: &'static str,
    ) -> Result<()> {
        let path = self.catalog_path();
        let payload = PutPayload::from(serde_json::to_vec(state)?);
        let cas_start = Instant::now();

        let opts = if expected_etag == "none" {
            // first write: Create so two processes cannot both initialize
            PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            }
        } else {
            PutOptions {
                mode: PutMode::Update(object_store::UpdateVersion {
                    e_tag: Some(expected_etag.to_string()),
                    version: None,
                }),
                ..Default::default()
            }
        };

        let result = match self.object_store.put_opts(&path, payload.clone(), opts).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Err(Error::Conflict),
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => {
                if !self.config.allow_unsafe_overwrite {
                    return Err(Error::Config(format!(
                        "conditional writes are required for {} but the object store \
                         does not support them",
                        path
                    )));
                }
                warn!(
                    "CAS not supported for {} at {} - explicitly opting into unsafe overwrite mode",
                    operation, path
                );
                let overwrite = PutOptions {
                    mode: PutMode::Overwrite,
                    ..Default::default()
                };
                self.object_store
                    .put_opts(&path, payload, overwrite)
                    .await
                    .map(|_| ())
                    .map_err(Error::ObjectStore)
            }
            Err(e) => Err(Error::ObjectStore(e)),
        };

        let label = match &result {
            Ok(()) => "ok",
            Err(Error::Conflict) => "conflict",
            Err(_) => "error",
        };
        counter!(
            "rangemover_catalog_cas_attempts_total",
            "operation" => operation,
            "result" => label
        )
        .increment(1);
        histogram!("rangemover_catalog_cas_duration_seconds", "operation" => operation)
            .record(cas_start.elapsed().as_secs_f64());
        result
    }
}

#[async_trait]
impl RoutingCatalog for ObjectStoreRoutingCatalog {
    async fn create_collection(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        chunks: Vec<ChunkOwnership>,
    ) -> Result<CollectionRouting> {
        let routing = cas_retry!("create_collection", {
            let (mut state, etag) = self.load_with_etag().await?;
            if let Some(existing) = state.collections.get(namespace) {
                if existing.collection_uuid == collection_uuid {
                    return Ok(existing.clone());
                }
            }
            let routing = state.create_collection(namespace, collection_uuid, chunks.clone())?;
            self.save_with_cas(&state, &etag, "create_collection").await?;
            Ok(routing)
        })?;
        info!(namespace, %collection_uuid, "Registered collection routing");
        Ok(routing)
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        cas_retry!("drop_collection", {
            let (mut state, etag) = self.load_with_etag().await?;
            if !state.drop_collection(namespace) {
                return Ok(());
            }
            self.save_with_cas(&state, &etag, "drop_collection").await
        })?;
        info!(namespace, "Dropped collection routing");
        Ok(())
    }

    async fn get_collection(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        let (state, _) = self.load_with_etag().await?;
        Ok(state.collections.get(namespace).cloned())
    }

    async fn conditional_reassign_range(
        &self,
        request: &ReassignRequest,
    ) -> Result<ReassignOutcome> {
        cas_retry!("conditional_reassign", {
            let (mut state, etag) = self.load_with_etag().await?;
            let (outcome, changed) = state.reassign(request);
            if changed {
                self.save_with_cas(&state, &etag, "conditional_reassign").await?;
            }
            debug!(migration_id = %request.migration_id, ?outcome, "Conditional reassign");
            Ok(outcome)
        })
    }

    async fn lookup_migration_outcome(
        &self,
        migration_id: MigrationId,
    ) -> Result<MigrationOutcome> {
        let (state, _) = self.load_with_etag().await?;
        Ok(state.lookup(migration_id))
    }

    async fn abort_migration(&self, migration_id: MigrationId) -> Result<MigrationOutcome> {
        cas_retry!("abort_migration", {
            let (mut state, etag) = self.load_with_etag().await?;
            let (outcome, changed) = state.abort(migration_id);
            if changed {
                self.save_with_cas(&state, &etag, "abort_migration").await?;
            }
            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{ConflictReason, KeyRange};
    use object_store::memory::InMemory;

    fn catalog(store: Arc<dyn ObjectStore>) -> ObjectStoreRoutingCatalog {
        ObjectStoreRoutingCatalog::new(store, ObjectStoreRoutingConfig::default())
    }

    #[tokio::test]
    async fn test_catalog_persists_across_instances() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let uuid = Uuid::new_v4();
        let first = catalog(store.clone());
        first
            .create_collection(
                "db.events",
                uuid,
                vec![ChunkOwnership::new(KeyRange::from_u64(0, 100), "shard-a")],
            )
            .await
            .unwrap();

        let request = ReassignRequest {
            namespace: "db.events".to_string(),
            collection_uuid: uuid,
            range: KeyRange::from_u64(0, 100),
            from: "shard-a".to_string(),
            to: "shard-b".to_string(),
            expected_epoch: 1,
            migration_id: MigrationId::new(),
        };
        assert_eq!(
            first.conditional_reassign_range(&request).await.unwrap(),
            ReassignOutcome::Committed(2)
        );

        let second = catalog(store);
        let routing = second.get_collection("db.events").await.unwrap().unwrap();
        assert_eq!(routing.epoch, 2);
        assert_eq!(routing.chunks[0].owner, "shard-b");
        assert_eq!(
            second.conditional_reassign_range(&request).await.unwrap(),
            ReassignOutcome::AlreadyApplied(2),
            "retried commit must be detected by a fresh catalog instance"
        );
    }

    #[tokio::test]
    async fn test_dropped_collection_refuses_commit() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let catalog = catalog(store);
        let uuid = Uuid::new_v4();
        catalog
            .create_collection(
                "db.events",
                uuid,
                vec![ChunkOwnership::new(KeyRange::from_u64(0, 100), "shard-a")],
            )
            .await
            .unwrap();
        catalog.drop_collection("db.events").await.unwrap();

        let request = ReassignRequest {
            namespace: "db.events".to_string(),
            collection_uuid: uuid,
            range: KeyRange::from_u64(0, 50),
            from: "shard-a".to_string(),
            to: "shard-b".to_string(),
            expected_epoch: 1,
            migration_id: MigrationId::new(),
        };
        assert_eq!(
            catalog.conditional_reassign_range(&request).await.unwrap(),
            ReassignOutcome::Conflict(ConflictReason::CollectionDropped)
        );
        assert_eq!(
            catalog.lookup_migration_outcome(request.migration_id).await.unwrap(),
            MigrationOutcome::Aborted
        );
    }
}
