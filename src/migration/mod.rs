//! Live range migration between shards
//!
//! A migration copies one key range of a namespace from a donor shard to a
//! recipient shard while the donor keeps serving writes, then flips ownership
//! in the routing catalog with a single conditional transaction. Every step
//! is recorded in a coordinator document on the donor's durable log so a
//! crash at any point resolves to exactly one decision.
//!
//! Lifecycle: `Initializing -> Cloning -> Blocking -> Committing -> Decided -> Done`.

mod cloner;
mod coordinator;
mod manager;
mod recovery;
mod telemetry;

pub use cloner::{CloneProgress, CloneRequest, ClonedMarker, RangeCloner};
pub use coordinator::MigrationCoordinator;
pub use manager::{MigrationManager, MigrationStatus, MigrationTracker};
pub use recovery::{RecoveryManager, RecoveryReport};

use crate::config::{env_duration_ms, env_parse};
use crate::range_deleter::{MigrationSide, RangeDeletionTask};
use crate::routing::{ConflictReason, Epoch, KeyRange, ShardId};
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of one migration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(Uuid);

impl MigrationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for MigrationId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|e| Error::Serialization(format!("invalid migration id '{}': {}", value, e)))
    }
}

/// Coordinator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Document written, preconditions checked, reservations being placed
    Initializing,
    /// Bulk copy and catch-up running
    Cloning,
    /// Donor critical section held, final drain running
    Blocking,
    /// Ownership transaction submitted (or about to be)
    Committing,
    /// Decision durable; cleanup hand-off not finished
    Decided,
    /// Cleanup handed off; the document can be removed
    Done,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Cloning => "cloning",
            LifecycleState::Blocking => "blocking",
            LifecycleState::Committing => "committing",
            LifecycleState::Decided => "decided",
            LifecycleState::Done => "done",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final, write-once outcome of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Committed,
    Aborted,
}

/// Why a migration was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    CollectionDropped,
    EpochConflict { expected: Epoch, actual: Epoch },
    OwnershipMismatch(String),
    /// Abort recorded in the routing catalog before the commit landed
    ExplicitAbort,
    ClonerAborted(String),
    DeadlineExceeded(String),
    Cancelled,
    /// Recipient still had deletions pending for an overlapping range
    OverlappingRangeDeletion,
    /// Commit response lost and the catalog had no outcome; fenced with an abort
    CommitOutcomeUnknown,
    Internal(String),
}

impl AbortReason {
    /// Map a pre-commit failure to the reason reported to the caller
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::ClonerAborted(msg) => AbortReason::ClonerAborted(msg.clone()),
            Error::DeadlineExceeded { operation, limit } => {
                AbortReason::DeadlineExceeded(format!("{} after {:?}", operation, limit))
            }
            Error::Cancelled => AbortReason::Cancelled,
            Error::NamespaceNotFound(_) | Error::CollectionUuidMismatch { .. } => {
                AbortReason::CollectionDropped
            }
            Error::EpochConflict { expected, actual } => AbortReason::EpochConflict {
                expected: *expected,
                actual: *actual,
            },
            other => AbortReason::Internal(other.to_string()),
        }
    }
}

impl From<ConflictReason> for AbortReason {
    fn from(reason: ConflictReason) -> Self {
        match reason {
            ConflictReason::StaleEpoch { expected, actual } => {
                AbortReason::EpochConflict { expected, actual }
            }
            ConflictReason::CollectionDropped => AbortReason::CollectionDropped,
            ConflictReason::OwnershipMismatch(msg) => AbortReason::OwnershipMismatch(msg),
            ConflictReason::ExplicitAbort => AbortReason::ExplicitAbort,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::CollectionDropped => write!(f, "collection dropped"),
            AbortReason::EpochConflict { expected, actual } => {
                write!(f, "routing epoch changed: expected {}, found {}", expected, actual)
            }
            AbortReason::OwnershipMismatch(msg) => write!(f, "ownership mismatch: {}", msg),
            AbortReason::ExplicitAbort => write!(f, "aborted in routing catalog"),
            AbortReason::ClonerAborted(msg) => write!(f, "cloner aborted: {}", msg),
            AbortReason::DeadlineExceeded(msg) => write!(f, "deadline exceeded: {}", msg),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::OverlappingRangeDeletion => {
                write!(f, "overlapping range deletion still pending on recipient")
            }
            AbortReason::CommitOutcomeUnknown => write!(f, "commit outcome unknown, fenced"),
            AbortReason::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

/// Durable state of one migration, stored on the donor under its migration id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCoordinatorDocument {
    pub migration_id: MigrationId,
    pub collection_uuid: Uuid,
    pub namespace: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    /// Write-once
    pub decision: Option<Decision>,
    pub lifecycle_state: LifecycleState,
    /// Routing epoch observed when the migration started
    pub expected_epoch: Epoch,
    #[serde(default)]
    pub committed_epoch: Option<Epoch>,
    #[serde(default)]
    pub abort_reason: Option<AbortReason>,
    pub started_at: DateTime<Utc>,
    pub donor_task_id: Uuid,
    pub recipient_task_id: Uuid,
}

impl MigrationCoordinatorDocument {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        migration_id: MigrationId,
        collection_uuid: Uuid,
        namespace: &str,
        range: KeyRange,
        donor: &str,
        recipient: &str,
        expected_epoch: Epoch,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            migration_id,
            collection_uuid,
            namespace: namespace.to_string(),
            range,
            donor: donor.to_string(),
            recipient: recipient.to_string(),
            decision: None,
            lifecycle_state: LifecycleState::Initializing,
            expected_epoch,
            committed_epoch: None,
            abort_reason: None,
            started_at,
            donor_task_id: Uuid::new_v4(),
            recipient_task_id: Uuid::new_v4(),
        }
    }

    /// Log key of this document
    pub fn key(&self) -> String {
        self.migration_id.to_string()
    }

    /// Move to `state`. Moving backwards is refused; re-entering the current
    /// state is allowed so recovery can retry its action.
    pub fn advance(&mut self, state: LifecycleState) -> Result<()> {
        if state < self.lifecycle_state {
            return Err(Error::Internal(format!(
                "migration {} cannot move from {} back to {}",
                self.migration_id, self.lifecycle_state, state
            )));
        }
        self.lifecycle_state = state;
        Ok(())
    }

    pub fn decide_committed(&mut self, epoch: Epoch) -> Result<()> {
        match self.decision {
            None => {
                self.decision = Some(Decision::Committed);
                self.committed_epoch = Some(epoch);
                Ok(())
            }
            Some(Decision::Committed) if self.committed_epoch == Some(epoch) => Ok(()),
            Some(existing) => Err(Error::Internal(format!(
                "migration {} already decided {:?}, refusing commit at epoch {}",
                self.migration_id, existing, epoch
            ))),
        }
    }

    pub fn decide_aborted(&mut self, reason: AbortReason) -> Result<()> {
        match self.decision {
            None => {
                self.decision = Some(Decision::Aborted);
                self.abort_reason = Some(reason);
                Ok(())
            }
            Some(Decision::Aborted) => Ok(()),
            Some(Decision::Committed) => Err(Error::Internal(format!(
                "migration {} already committed, refusing abort ({})",
                self.migration_id, reason
            ))),
        }
    }

    pub fn donor_reservation(&self) -> RangeDeletionTask {
        RangeDeletionTask::reservation(
            self.donor_task_id,
            self.migration_id,
            MigrationSide::Donor,
            &self.namespace,
            self.collection_uuid,
            self.range.clone(),
            &self.donor,
        )
    }

    pub fn recipient_reservation(&self) -> RangeDeletionTask {
        RangeDeletionTask::reservation(
            self.recipient_task_id,
            self.migration_id,
            MigrationSide::Recipient,
            &self.namespace,
            self.collection_uuid,
            self.range.clone(),
            &self.recipient,
        )
    }
}

/// A request to move `range` of `namespace` from `donor` to `recipient`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub namespace: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
}

/// Answer to `start_migration`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationResponse {
    Committed {
        migration_id: MigrationId,
        epoch: Epoch,
    },
    Aborted {
        migration_id: MigrationId,
        reason: AbortReason,
    },
    /// Refused before any state was written
    Rejected(String),
}

/// Migration coordinator and cloner configuration
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Documents per bulk-copy and catch-up batch
    pub clone_batch_size: usize,
    /// Consecutive transient failures tolerated per cloner step
    pub clone_max_attempts: u32,
    /// First retry delay after a transient cloner failure
    pub clone_retry_backoff: Duration,
    /// Upper bound on bulk copy plus catch-up
    pub clone_timeout: Duration,
    /// Catch-up stops once at most this many changes are outstanding
    pub max_catchup_lag: u64,
    /// Longest the donor may block writes to the range
    pub critical_section_timeout: Duration,
    /// Writes that may queue behind the critical section
    pub critical_section_queue_limit: usize,
    /// Deadline for one ownership transaction
    pub commit_timeout: Duration,
    /// Lookup/abort attempts before a commit outcome is left to recovery
    pub commit_resolution_attempts: u32,
    /// How long to wait for overlapping deletions on the recipient
    pub overlapping_deletion_timeout: Duration,
    /// Extra wait before the donor deletes committed-away documents
    pub orphan_cleanup_delay: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 256,
            clone_max_attempts: 5,
            clone_retry_backoff: Duration::from_millis(50),
            clone_timeout: Duration::from_secs(600),
            max_catchup_lag: 16,
            critical_section_timeout: Duration::from_secs(5),
            critical_section_queue_limit: 1024,
            commit_timeout: Duration::from_secs(5),
            commit_resolution_attempts: 5,
            overlapping_deletion_timeout: Duration::from_secs(60),
            orphan_cleanup_delay: Duration::ZERO,
        }
    }
}

impl MigrationConfig {
    /// Environment variables (all optional):
    /// - MIGRATION_CLONE_BATCH_SIZE
    /// - MIGRATION_CLONE_MAX_ATTEMPTS
    /// - MIGRATION_CLONE_RETRY_BACKOFF_MS
    /// - MIGRATION_CLONE_TIMEOUT_MS
    /// - MIGRATION_MAX_CATCHUP_LAG
    /// - MIGRATION_CRITICAL_SECTION_TIMEOUT_MS
    /// - MIGRATION_CRITICAL_SECTION_QUEUE_LIMIT
    /// - MIGRATION_COMMIT_TIMEOUT_MS
    /// - MIGRATION_COMMIT_RESOLUTION_ATTEMPTS
    /// - MIGRATION_OVERLAPPING_DELETION_TIMEOUT_MS
    /// - MIGRATION_ORPHAN_CLEANUP_DELAY_MS
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            clone_batch_size: env_parse("MIGRATION_CLONE_BATCH_SIZE", defaults.clone_batch_size)?,
            clone_max_attempts: env_parse(
                "MIGRATION_CLONE_MAX_ATTEMPTS",
                defaults.clone_max_attempts,
            )?,
            clone_retry_backoff: env_duration_ms(
                "MIGRATION_CLONE_RETRY_BACKOFF_MS",
                defaults.clone_retry_backoff,
            )?,
            clone_timeout: env_duration_ms("MIGRATION_CLONE_TIMEOUT_MS", defaults.clone_timeout)?,
            max_catchup_lag: env_parse("MIGRATION_MAX_CATCHUP_LAG", defaults.max_catchup_lag)?,
            critical_section_timeout: env_duration_ms(
                "MIGRATION_CRITICAL_SECTION_TIMEOUT_MS",
                defaults.critical_section_timeout,
            )?,
            critical_section_queue_limit: env_parse(
                "MIGRATION_CRITICAL_SECTION_QUEUE_LIMIT",
                defaults.critical_section_queue_limit,
            )?,
            commit_timeout: env_duration_ms(
                "MIGRATION_COMMIT_TIMEOUT_MS",
                defaults.commit_timeout,
            )?,
            commit_resolution_attempts: env_parse(
                "MIGRATION_COMMIT_RESOLUTION_ATTEMPTS",
                defaults.commit_resolution_attempts,
            )?,
            overlapping_deletion_timeout: env_duration_ms(
                "MIGRATION_OVERLAPPING_DELETION_TIMEOUT_MS",
                defaults.overlapping_deletion_timeout,
            )?,
            orphan_cleanup_delay: env_duration_ms(
                "MIGRATION_ORPHAN_CLEANUP_DELAY_MS",
                defaults.orphan_cleanup_delay,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clone_batch_size == 0 {
            return Err(Error::Config("clone_batch_size must be > 0".into()));
        }
        if self.clone_max_attempts == 0 {
            return Err(Error::Config("clone_max_attempts must be > 0".into()));
        }
        if self.critical_section_queue_limit == 0 {
            return Err(Error::Config("critical_section_queue_limit must be > 0".into()));
        }
        if self.commit_resolution_attempts == 0 {
            return Err(Error::Config("commit_resolution_attempts must be > 0".into()));
        }
        Ok(())
    }

    /// Delay before cloner retry number `attempt` (1-based)
    pub fn clone_backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.clone_retry_backoff.saturating_mul(factor)
    }
}
