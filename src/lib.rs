//! # rangemover
//!
//! Crash-safe chunk migration and orphaned range cleanup for a sharded
//! document store.
//!
//! A namespace is split into contiguous key ranges (chunks), each owned by
//! exactly one shard. Moving a chunk clones its documents to the recipient,
//! blocks writes for a short bounded critical section, and commits the new
//! owner through an epoch-guarded routing catalog. Whichever side ends up
//! holding documents it no longer owns deletes them later, once no reader
//! can still be routed to them.
//!
//! ## Architecture
//!
//! - **Routing**: authoritative ownership catalog with compare-and-swap epochs
//! - **Migration**: coordinator state machine persisted on the donor, with
//!   recovery after restarts
//! - **Range deleter**: durable, throttled deletion tasks gated by a
//!   visibility fence
//! - **Shard**: per-shard document store, durable log and write blocking

pub mod clock;
pub mod config;
pub mod durable;
pub mod migration;
pub mod range_deleter;
pub mod routing;
pub mod shard;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::BoundedClock;
    pub use crate::config::{ComponentFactory, RuntimeConfig};
    pub use crate::migration::{
        MigrationConfig, MigrationId, MigrationManager, MigrationRequest, MigrationResponse,
        RecoveryManager,
    };
    pub use crate::range_deleter::{RangeDeleterConfig, RangeDeletionScheduler};
    pub use crate::routing::{KeyRange, RoutingCatalog, ShardKey, ShardRouter};
    pub use crate::shard::{Document, Shard, ShardDirectory, ShardParts};
    pub use crate::{Error, Result};
}
