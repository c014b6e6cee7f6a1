//! Component factory for environment-based configuration
//!
//! This module provides factory methods to create object stores, routing
//! catalogs, durable logs and visibility fences based on environment
//! variables, enabling easy switching between development and production
//! configurations.

use crate::clock::BoundedClock;
use crate::durable::{DurableLog, ObjectStoreLog};
use crate::migration::MigrationConfig;
use crate::range_deleter::{
    FenceKind, RangeDeleterConfig, ReaderEpochFence, ReaderPinRegistry, StalenessTimerFence,
    VisibilityFence,
};
use crate::routing::{
    LocalRoutingCatalog, ObjectStoreRoutingCatalog, ObjectStoreRoutingConfig, RoutingCatalog,
};
use crate::{Error, Result};
use object_store::{aws::AmazonS3Builder, memory::InMemory, ObjectStore};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Read `name` from the environment, falling back to `default` when unset
pub fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{} has invalid value '{}': {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}

/// Read a millisecond duration from the environment
pub fn env_duration_ms(name: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(name, default_ms).map(Duration::from_millis)
}

/// Process-wide settings shared by every shard
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub migration: MigrationConfig,
    pub range_deleter: RangeDeleterConfig,
    /// Bound on clock disagreement between processes
    pub max_clock_skew: Duration,
    /// How long a router may serve a cached routing table
    pub routing_cache_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            migration: MigrationConfig::default(),
            range_deleter: RangeDeleterConfig::default(),
            max_clock_skew: Duration::from_secs(1),
            routing_cache_ttl: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Environment variables:
    /// - CLOCK_MAX_SKEW_MS (default 1000)
    /// - ROUTING_CACHE_TTL_MS (default 10000)
    /// - plus those read by [`MigrationConfig::from_env`] and
    ///   [`RangeDeleterConfig::from_env`]
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            migration: MigrationConfig::from_env()?,
            range_deleter: RangeDeleterConfig::from_env()?,
            max_clock_skew: env_duration_ms("CLOCK_MAX_SKEW_MS", defaults.max_clock_skew)?,
            routing_cache_ttl: env_duration_ms("ROUTING_CACHE_TTL_MS", defaults.routing_cache_ttl)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.migration.validate()?;
        self.range_deleter.validate()?;
        // cached tables bound reader staleness under either fence
        if self.routing_cache_ttl > self.range_deleter.max_routing_staleness {
            return Err(Error::Config(format!(
                "routing cache ttl {:?} exceeds max routing staleness {:?}; \
                 orphans could be deleted while readers still route to them",
                self.routing_cache_ttl, self.range_deleter.max_routing_staleness
            )));
        }
        Ok(())
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default) or "s3"
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub async fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!(bucket = %bucket, region = %region, "Using S3 object store");

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory' or 's3'",
                backend
            ))),
        }
    }

    /// Create routing catalog from environment
    ///
    /// Environment variables:
    /// - CATALOG_BACKEND: "local" (default) or "object_store"
    /// - CATALOG_PREFIX: object prefix for the catalog (default: routing/)
    /// - CATALOG_ALLOW_UNSAFE_OVERWRITE: allow stores without conditional puts
    pub async fn create_routing_catalog(
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<dyn RoutingCatalog>> {
        let backend = std::env::var("CATALOG_BACKEND").unwrap_or_else(|_| "local".to_string());

        match backend.as_str() {
            "local" => {
                info!("Using LocalRoutingCatalog (development mode)");
                Ok(Arc::new(LocalRoutingCatalog::new()))
            }
            "object_store" => {
                let defaults = ObjectStoreRoutingConfig::default();
                let config = ObjectStoreRoutingConfig {
                    prefix: std::env::var("CATALOG_PREFIX").unwrap_or(defaults.prefix),
                    allow_unsafe_overwrite: std::env::var("CATALOG_ALLOW_UNSAFE_OVERWRITE")
                        .map(|value| {
                            let value = value.trim();
                            value == "1" || value.eq_ignore_ascii_case("true")
                        })
                        .unwrap_or(false),
                };
                info!(prefix = %config.prefix, "Using ObjectStoreRoutingCatalog");
                Ok(Arc::new(ObjectStoreRoutingCatalog::new(object_store, config)))
            }
            _ => Err(Error::Config(format!(
                "Unknown CATALOG_BACKEND: {}. Use 'local' or 'object_store'",
                backend
            ))),
        }
    }

    /// Durable log of one shard, stored under `shards/{shard_id}/`
    pub fn create_durable_log(
        object_store: Arc<dyn ObjectStore>,
        shard_id: &str,
        clock: Arc<BoundedClock>,
    ) -> Arc<dyn DurableLog> {
        Arc::new(ObjectStoreLog::for_shard(object_store, shard_id, clock))
    }

    /// Visibility fence selected by `config.fence`
    pub fn create_visibility_fence(
        config: &RangeDeleterConfig,
        pins: &ReaderPinRegistry,
    ) -> Arc<dyn VisibilityFence> {
        match config.fence {
            FenceKind::StalenessTimer => {
                Arc::new(StalenessTimerFence::new(config.max_routing_staleness))
            }
            FenceKind::ReaderEpoch => Arc::new(ReaderEpochFence::new(pins.clone())),
        }
    }
}
