//! Routing of reads and writes to the shard that owns a key

use super::{CollectionRouting, RoutingCatalog, ShardKey};
use crate::range_deleter::{ReaderPin, ReaderPinRegistry};
use crate::shard::{Document, Shard, ShardDirectory};
use crate::{Error, Result};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cached routing entry. Holds a pin on its epoch until it is replaced,
/// invalidated or evicted.
#[derive(Debug, Clone)]
struct RoutingEntry {
    routing: CollectionRouting,
    pin: Arc<ReaderPin>,
    cached_at: Instant,
}

/// Routes operations with a TTL cache of routing tables.
///
/// A cached table may be at most `ttl` old, so the staleness fence of the
/// range deleter must allow at least that long. Every cached table pins its
/// epoch in the reader pin registry, so the reader-epoch fence keeps orphans
/// alive while any router may still send reads to the losing shard.
pub struct ShardRouter {
    catalog: Arc<dyn RoutingCatalog>,
    directory: Arc<ShardDirectory>,
    pins: ReaderPinRegistry,
    cache: DashMap<String, RoutingEntry>,
    ttl: Duration,
}

impl ShardRouter {
    const MAX_RETRIES: usize = 3;

    pub fn new(
        catalog: Arc<dyn RoutingCatalog>,
        directory: Arc<ShardDirectory>,
        pins: ReaderPinRegistry,
        ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            directory,
            pins,
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn pins(&self) -> &ReaderPinRegistry {
        &self.pins
    }

    /// Routing table for `namespace`, from cache while fresh
    pub async fn routing(&self, namespace: &str) -> Result<CollectionRouting> {
        let (routing, _pin) = self.pinned_routing(namespace).await?;
        Ok(routing)
    }

    /// Routing table together with the pin that keeps its epoch visible.
    ///
    /// On a miss the epoch is pinned first and the table fetched again; a
    /// table that changed in between is discarded, so no fence check can run
    /// between reading an epoch and pinning it.
    async fn pinned_routing(&self, namespace: &str) -> Result<(CollectionRouting, Arc<ReaderPin>)> {
        if let Some(cached) = self.cached(namespace) {
            return Ok(cached);
        }

        for attempt in 0..Self::MAX_RETRIES {
            let routing = self.fetch(namespace).await?;
            let pin = Arc::new(self.pins.pin(namespace, routing.epoch));
            let confirmed = self.fetch(namespace).await?;
            if confirmed.epoch != routing.epoch
                || confirmed.collection_uuid != routing.collection_uuid
            {
                debug!(
                    namespace,
                    pinned = routing.epoch,
                    current = confirmed.epoch,
                    attempt,
                    "Routing changed while pinning, refetching"
                );
                continue;
            }

            self.evict_expired();
            self.cache.insert(
                namespace.to_string(),
                RoutingEntry {
                    routing: routing.clone(),
                    pin: pin.clone(),
                    cached_at: Instant::now(),
                },
            );
            return Ok((routing, pin));
        }

        Err(Error::TooManyRetries)
    }

    fn cached(&self, namespace: &str) -> Option<(CollectionRouting, Arc<ReaderPin>)> {
        let entry = self.cache.get(namespace)?;
        if entry.cached_at.elapsed() > self.ttl {
            return None;
        }
        Some((entry.routing.clone(), entry.pin.clone()))
    }

    async fn fetch(&self, namespace: &str) -> Result<CollectionRouting> {
        self.catalog
            .get_collection(namespace)
            .await?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))
    }

    /// Drop expired tables and release their epoch pins
    pub fn evict_expired(&self) {
        self.cache.retain(|_, entry| entry.cached_at.elapsed() <= self.ttl);
    }

    /// Invalidate routing for a namespace
    pub fn invalidate(&self, namespace: &str) {
        self.cache.remove(namespace);
    }

    pub async fn write(&self, namespace: &str, document: Document) -> Result<u64> {
        let key = document.key.clone();
        self.route(namespace, &key, |shard| {
            let document = document.clone();
            async move { shard.write(namespace, document).await }
        })
        .await
    }

    pub async fn remove(&self, namespace: &str, key: &ShardKey) -> Result<u64> {
        self.route(namespace, key, |shard| async move {
            shard.remove(namespace, key).await
        })
        .await
    }

    /// Read a document from its owner. Reads are never blocked by migrations.
    pub async fn read(&self, namespace: &str, key: &ShardKey) -> Result<Option<Document>> {
        let (routing, _pin) = self.pinned_routing(namespace).await?;
        let owner = routing
            .owner_for(key)
            .ok_or_else(|| Error::Internal(format!("{} has no chunk for key {}", namespace, key)))?;
        let shard = self.directory.get(&owner.owner)?;
        shard.store().get(namespace, key).await
    }

    /// Route an operation with automatic retry on shard moves
    async fn route<F, Fut, T>(&self, namespace: &str, key: &ShardKey, execute: F) -> Result<T>
    where
        F: Fn(Arc<Shard>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 0..Self::MAX_RETRIES {
            let routing = self.routing(namespace).await?;
            let owner = routing.owner_for(key).ok_or_else(|| {
                Error::Internal(format!("{} has no chunk for key {}", namespace, key))
            })?;
            let shard = self.directory.get(&owner.owner)?;

            match execute(shard).await {
                Err(Error::ShardMoved {
                    new_location,
                    epoch,
                }) => {
                    debug!(
                        namespace,
                        %key,
                        %new_location,
                        epoch,
                        attempt,
                        "Shard moved, refreshing routing"
                    );
                    self.invalidate(namespace);
                }
                result => return result,
            }
        }

        Err(Error::TooManyRetries)
    }
}
