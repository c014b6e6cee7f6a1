//! Range deletion scheduler
//!
//! After a migration decides, the shard that lost the range still holds a
//! copy of its documents (orphans). Deletion tasks for those copies are
//! persisted on the losing shard, wait for a visibility fence so no reader
//! routed with an old routing table can still observe them, and are then
//! executed in throttled batches that re-verify ownership before every batch.

mod fence;
mod scheduler;
mod telemetry;
mod throttle;

pub use fence::{
    ReaderEpochFence, ReaderPin, ReaderPinRegistry, StalenessTimerFence, VisibilityFence,
};
pub use scheduler::{RangeDeletionScheduler, TickReport};
pub use throttle::DeletionThrottle;

use crate::config::{env_duration_ms, env_parse};
use crate::migration::MigrationId;
use crate::routing::{Epoch, KeyRange, ShardId};
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Which side of a migration a task was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationSide {
    Donor,
    Recipient,
}

/// When a handed-off task may start deleting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhenToClean {
    /// As soon as the visibility fence clears
    Immediate,
    /// Fence clear and this long after hand-off
    Delayed(Duration),
}

impl WhenToClean {
    pub fn delay(&self) -> Duration {
        match self {
            WhenToClean::Immediate => Duration::ZERO,
            WhenToClean::Delayed(delay) => *delay,
        }
    }
}

/// Durable record of a range whose local documents must be deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    pub task_id: Uuid,
    pub migration_id: MigrationId,
    pub side: MigrationSide,
    pub namespace: String,
    /// Generation the orphans belong to; a recreated namespace is never touched
    pub collection_uuid: Uuid,
    pub range: KeyRange,
    /// Shard holding the documents to delete
    pub owner_before_deletion: ShardId,
    /// Not yet eligible to execute
    pub pending: bool,
    pub when_to_clean: WhenToClean,
    /// Routing epoch after which the range stopped belonging here.
    /// `None` while the task is only a reservation held by a running migration.
    #[serde(default)]
    pub fence_epoch: Option<Epoch>,
    #[serde(default)]
    pub handed_off_at: Option<DateTime<Utc>>,
    /// Documents deleted so far, for diagnostics
    #[serde(default)]
    pub deleted_count: u64,
}

impl RangeDeletionTask {
    /// Reservation written before cloning starts. The migration coordinator
    /// either hands it off for execution or forgets it once it decides.
    pub fn reservation(
        task_id: Uuid,
        migration_id: MigrationId,
        side: MigrationSide,
        namespace: &str,
        collection_uuid: Uuid,
        range: KeyRange,
        owner: &str,
    ) -> Self {
        Self {
            task_id,
            migration_id,
            side,
            namespace: namespace.to_string(),
            collection_uuid,
            range,
            owner_before_deletion: owner.to_string(),
            pending: true,
            when_to_clean: WhenToClean::Immediate,
            fence_epoch: None,
            handed_off_at: None,
            deleted_count: 0,
        }
    }

    pub fn is_reservation(&self) -> bool {
        self.fence_epoch.is_none()
    }

    /// Turn a reservation into a task the scheduler will execute once the
    /// visibility fence and `when_to_clean` allow it.
    pub fn hand_off(&mut self, fence_epoch: Epoch, when_to_clean: WhenToClean, at: DateTime<Utc>) {
        self.fence_epoch = Some(fence_epoch);
        self.when_to_clean = when_to_clean;
        self.handed_off_at = Some(at);
        self.pending = true;
    }
}

/// Result of running a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Range is empty; the task has been removed
    Completed { deleted: u64 },
    /// Transient failure; try again after the backoff
    Retry(Duration),
    /// Task no longer applies (namespace dropped, generation changed, or the
    /// shard owns the range again); removed without deleting anything
    PermanentlyStale(String),
}

/// Which visibility fence a scheduler uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    StalenessTimer,
    ReaderEpoch,
}

impl std::str::FromStr for FenceKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "staleness_timer" | "timer" => Ok(Self::StalenessTimer),
            "reader_epoch" | "epoch" => Ok(Self::ReaderEpoch),
            other => Err(Error::Config(format!(
                "unknown fence kind '{}'; expected staleness_timer or reader_epoch",
                other
            ))),
        }
    }
}

/// Range deleter configuration
#[derive(Debug, Clone)]
pub struct RangeDeleterConfig {
    /// Documents deleted per batch
    pub batch_size: usize,
    /// Pause between batches of one task
    pub batch_delay: Duration,
    /// Throttle across all tasks of the shard (0 = unlimited)
    pub max_docs_per_second: u64,
    /// Tasks executing concurrently
    pub max_concurrent_tasks: usize,
    /// How often the run loop promotes and dispatches tasks
    pub tick_interval: Duration,
    /// Readers can hold a routing table at most this long
    pub max_routing_staleness: Duration,
    /// First retry delay after a transient failure
    pub retry_base_backoff: Duration,
    /// Cap on the retry delay
    pub retry_max_backoff: Duration,
    pub fence: FenceKind,
}

impl Default for RangeDeleterConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            batch_delay: Duration::from_millis(20),
            max_docs_per_second: 0,
            max_concurrent_tasks: 2,
            tick_interval: Duration::from_millis(250),
            max_routing_staleness: Duration::from_secs(30),
            retry_base_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(30),
            fence: FenceKind::StalenessTimer,
        }
    }
}

impl RangeDeleterConfig {
    /// Environment variables (all optional):
    /// - RANGE_DELETER_BATCH_SIZE
    /// - RANGE_DELETER_BATCH_DELAY_MS
    /// - RANGE_DELETER_MAX_DOCS_PER_SECOND
    /// - RANGE_DELETER_MAX_CONCURRENT_TASKS
    /// - RANGE_DELETER_TICK_MS
    /// - RANGE_DELETER_MAX_ROUTING_STALENESS_MS
    /// - RANGE_DELETER_RETRY_BASE_BACKOFF_MS / RANGE_DELETER_RETRY_MAX_BACKOFF_MS
    /// - RANGE_DELETER_FENCE: staleness_timer (default) or reader_epoch
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            batch_size: env_parse("RANGE_DELETER_BATCH_SIZE", defaults.batch_size)?,
            batch_delay: env_duration_ms("RANGE_DELETER_BATCH_DELAY_MS", defaults.batch_delay)?,
            max_docs_per_second: env_parse(
                "RANGE_DELETER_MAX_DOCS_PER_SECOND",
                defaults.max_docs_per_second,
            )?,
            max_concurrent_tasks: env_parse(
                "RANGE_DELETER_MAX_CONCURRENT_TASKS",
                defaults.max_concurrent_tasks,
            )?,
            tick_interval: env_duration_ms("RANGE_DELETER_TICK_MS", defaults.tick_interval)?,
            max_routing_staleness: env_duration_ms(
                "RANGE_DELETER_MAX_ROUTING_STALENESS_MS",
                defaults.max_routing_staleness,
            )?,
            retry_base_backoff: env_duration_ms(
                "RANGE_DELETER_RETRY_BASE_BACKOFF_MS",
                defaults.retry_base_backoff,
            )?,
            retry_max_backoff: env_duration_ms(
                "RANGE_DELETER_RETRY_MAX_BACKOFF_MS",
                defaults.retry_max_backoff,
            )?,
            fence: match std::env::var("RANGE_DELETER_FENCE") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.fence,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("range deleter batch_size must be > 0".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Config("range deleter max_concurrent_tasks must be > 0".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("range deleter tick_interval must be > 0".into()));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_backoff
            .saturating_mul(factor)
            .min(self.retry_max_backoff)
    }
}
