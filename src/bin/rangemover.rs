//! rangemover demo node
//!
//! Assembles an in-process cluster of shards over the configured object
//! store and routing catalog, recovers any migration state left behind by a
//! previous run, moves one chunk between two shards, and keeps the range
//! deleters running until the orphans are gone.

use rangemover::clock::BoundedClock;
use rangemover::config::{ComponentFactory, RuntimeConfig};
use rangemover::migration::{MigrationId, MigrationManager, MigrationRequest, RecoveryManager};
use rangemover::range_deleter::ReaderPinRegistry;
use rangemover::routing::{ChunkOwnership, KeyRange, RoutingCatalog, ShardKey, ShardRouter};
use rangemover::shard::{Document, MemoryShardStore, Shard, ShardDirectory, ShardParts, ShardStore};
use rangemover::telemetry::Telemetry;

use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

/// rangemover chunk migration demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Donor shard id
    #[arg(long, default_value = "shard-a")]
    donor: String,

    /// Recipient shard id
    #[arg(long, default_value = "shard-b")]
    recipient: String,

    /// Namespace to create and migrate
    #[arg(long, default_value = "demo.orders")]
    namespace: String,

    /// Documents seeded on the donor, keyed 0..docs
    #[arg(long, default_value = "500")]
    docs: u64,

    /// Lower bound of the migrated chunk
    #[arg(long, default_value = "0")]
    range_min: u64,

    /// Upper bound (exclusive) of the migrated chunk
    #[arg(long, default_value = "100")]
    range_max: u64,

    /// Seconds to wait for orphan cleanup before exiting
    #[arg(long, default_value = "60")]
    cleanup_timeout_secs: u64,

    /// Keep serving until Ctrl+C after the migration
    #[arg(long)]
    hold: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("rangemover", &args.log_level)?;

    info!("Starting rangemover");

    let config = RuntimeConfig::from_env()?;
    let object_store = ComponentFactory::create_object_store().await?;
    let catalog = ComponentFactory::create_routing_catalog(object_store.clone()).await?;
    let pins = ReaderPinRegistry::new();
    let directory = Arc::new(ShardDirectory::new());

    for id in [&args.donor, &args.recipient] {
        let clock = Arc::new(BoundedClock::new(config.max_clock_skew));
        let shard = Shard::new(
            id.as_str(),
            ShardParts {
                store: Arc::new(MemoryShardStore::new()),
                log: ComponentFactory::create_durable_log(object_store.clone(), id, clock.clone()),
                catalog: catalog.clone(),
                fence: ComponentFactory::create_visibility_fence(&config.range_deleter, &pins),
                clock,
                deleter_config: config.range_deleter.clone(),
            },
        );
        directory.insert(shard);
    }

    let recovery =
        RecoveryManager::new(config.migration.clone(), catalog.clone(), directory.clone());
    for id in directory.ids() {
        let shard = directory.get(&id)?;
        let report = recovery.recover(&shard).await?;
        info!(shard = %id, ?report, "Shard recovered");
    }

    let mut deleters = Vec::new();
    for id in directory.ids() {
        let scheduler = directory.get(&id)?.range_deleter().clone();
        let shutdown = scheduler.shutdown_token();
        deleters.push((shutdown, tokio::spawn(scheduler.run())));
    }

    let router = ShardRouter::new(
        catalog.clone(),
        directory.clone(),
        pins.clone(),
        config.routing_cache_ttl,
    );

    if catalog.get_collection(&args.namespace).await?.is_none() {
        let uuid = Uuid::new_v4();
        catalog
            .create_collection(
                &args.namespace,
                uuid,
                vec![ChunkOwnership::new(
                    KeyRange::new(ShardKey::from_u64(0), ShardKey::from_u64(u64::MAX)),
                    args.donor.as_str(),
                )],
            )
            .await?;
        for id in directory.ids() {
            directory
                .get(&id)?
                .store()
                .create_collection(&args.namespace, uuid)
                .await?;
        }
        for key in 0..args.docs {
            router
                .write(&args.namespace, Document::new(key, json!({ "n": key })))
                .await?;
        }
        info!(namespace = %args.namespace, docs = args.docs, "Seeded namespace");
    }

    let manager =
        MigrationManager::new(config.migration.clone(), catalog.clone(), directory.clone());
    let range = KeyRange::from_u64(args.range_min, args.range_max);
    let migration_id = MigrationId::new();
    let response = manager
        .start_migration_with_id(
            migration_id,
            MigrationRequest {
                namespace: args.namespace.clone(),
                range: range.clone(),
                donor: args.donor.clone(),
                recipient: args.recipient.clone(),
            },
        )
        .await?;
    info!(%migration_id, ?response, "Migration finished");
    // release the router's pin on the pre-migration epoch
    router.invalidate(&args.namespace);

    let cleanup_timeout = Duration::from_secs(args.cleanup_timeout_secs);
    for id in directory.ids() {
        let shard = directory.get(&id)?;
        match shard.range_deleter().run_until_idle(cleanup_timeout).await {
            Ok(()) => {
                let remaining = shard.store().count_in_range(&args.namespace, &range).await?;
                info!(shard = %id, %range, remaining, "Range deleter idle");
            }
            Err(e) => warn!(shard = %id, error = %e, "Range deleter still busy"),
        }
    }

    if args.hold {
        info!("Holding until shutdown signal");
        shutdown_signal().await;
    }

    for (shutdown, handle) in deleters {
        shutdown.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Range deleter task failed to join");
        }
    }

    info!("rangemover shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
