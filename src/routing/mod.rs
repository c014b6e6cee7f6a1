//! Authoritative routing state: which shard owns which key range
//!
//! The routing catalog is the only place ownership changes become visible.
//! Every mutation is epoch-guarded (compare-and-swap on the namespace epoch),
//! and migration outcomes are recorded alongside the routing table so a
//! commit retried with the same migration id is detected instead of re-applied.

mod catalog;
mod local;
mod object_store;
mod router;

pub use catalog::{ReassignRequest, RoutingCatalog};
pub use local::LocalRoutingCatalog;
pub use object_store::{ObjectStoreRoutingCatalog, ObjectStoreRoutingConfig};
pub use router::ShardRouter;

use crate::migration::MigrationId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Shard (node-group) identifier
pub type ShardId = String;

/// Routing table version, bumped on every ownership change of a namespace
pub type Epoch = u64;

/// Shard key, compared lexicographically as raw bytes
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey(Vec<u8>);

impl ShardKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Big-endian encoding so integer order equals key order.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode a key produced by [`ShardKey::from_u64`].
    pub fn as_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for ShardKey {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u64() {
            Some(value) => write!(f, "{}", value),
            None => {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Half-open key interval `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl KeyRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Self {
        Self { min, max }
    }

    pub fn from_u64(min: u64, max: u64) -> Self {
        Self::new(ShardKey::from_u64(min), ShardKey::from_u64(max))
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        key >= &self.min && key < &self.max
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.min >= self.min && other.max <= self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// One contiguous range and the shard that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOwnership {
    pub range: KeyRange,
    pub owner: ShardId,
}

impl ChunkOwnership {
    pub fn new(range: KeyRange, owner: impl Into<ShardId>) -> Self {
        Self {
            range,
            owner: owner.into(),
        }
    }
}

/// Routing table of one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRouting {
    pub namespace: String,
    pub collection_uuid: Uuid,
    pub epoch: Epoch,
    /// Sorted by range minimum, non-overlapping
    pub chunks: Vec<ChunkOwnership>,
}

impl CollectionRouting {
    /// Chunk containing `key`, if the key falls inside the routed key space.
    pub fn owner_for(&self, key: &ShardKey) -> Option<&ChunkOwnership> {
        self.chunks.iter().find(|c| c.range.contains(key))
    }

    /// All chunks intersecting `range`.
    pub fn overlapping(&self, range: &KeyRange) -> impl Iterator<Item = &ChunkOwnership> {
        let range = range.clone();
        self.chunks.iter().filter(move |c| c.range.overlaps(&range))
    }

    /// Whether `shard` currently owns any key inside `range`.
    pub fn owns_any(&self, shard: &str, range: &KeyRange) -> bool {
        self.overlapping(range).any(|c| c.owner == shard)
    }
}

/// Why a conditional reassignment was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// Routing epoch moved since the migration recorded it
    StaleEpoch { expected: Epoch, actual: Epoch },
    /// Namespace dropped or recreated under a different UUID
    CollectionDropped,
    /// Range is not wholly inside one chunk owned by the donor
    OwnershipMismatch(String),
    /// An abort was recorded for this migration id before the commit arrived
    ExplicitAbort,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::StaleEpoch { expected, actual } => {
                write!(f, "stale epoch: expected {}, found {}", expected, actual)
            }
            ConflictReason::CollectionDropped => write!(f, "collection dropped"),
            ConflictReason::OwnershipMismatch(msg) => write!(f, "ownership mismatch: {}", msg),
            ConflictReason::ExplicitAbort => write!(f, "migration explicitly aborted"),
        }
    }
}

/// Result of `ConditionalReassignRange`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassignOutcome {
    /// Range reassigned; carries the new epoch
    Committed(Epoch),
    /// Precondition failed; nothing changed
    Conflict(ConflictReason),
    /// Same migration id already committed; carries the epoch it produced
    AlreadyApplied(Epoch),
}

/// Result of `LookupMigrationOutcome`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOutcome {
    Committed(Epoch),
    Aborted,
    Unknown,
}

/// Outcome recorded in the catalog for one migration id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordedOutcome {
    Committed { epoch: Epoch },
    Aborted,
}

/// A recorded outcome and when it was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub outcome: RecordedOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl From<RecordedOutcome> for MigrationOutcome {
    fn from(recorded: RecordedOutcome) -> Self {
        match recorded {
            RecordedOutcome::Committed { epoch } => MigrationOutcome::Committed(epoch),
            RecordedOutcome::Aborted => MigrationOutcome::Aborted,
        }
    }
}

/// Whole catalog contents. Both backends mutate this through the same
/// methods; the object-store backend persists it as a single object so
/// routing and outcome records change atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogState {
    /// Format version for forward compatibility
    #[serde(default)]
    pub version: u32,
    pub collections: BTreeMap<String, CollectionRouting>,
    /// Keyed by migration id string; survives namespace drops
    #[serde(default)]
    pub migration_outcomes: BTreeMap<String, OutcomeRecord>,
}

impl CatalogState {
    pub const CURRENT_VERSION: u32 = 1;

    /// Days an outcome stays answerable. Must exceed the longest time a
    /// donor can stay down with an undecided migration, since an expired
    /// record looks like a migration that never committed.
    pub const OUTCOME_RETENTION_DAYS: i64 = 7;

    /// Register a namespace. Idempotent for the same UUID.
    pub fn create_collection(
        &mut self,
        namespace: &str,
        collection_uuid: Uuid,
        mut chunks: Vec<ChunkOwnership>,
    ) -> Result<CollectionRouting> {
        if let Some(existing) = self.collections.get(namespace) {
            if existing.collection_uuid == collection_uuid {
                return Ok(existing.clone());
            }
            return Err(Error::Internal(format!(
                "namespace {} already exists with uuid {}",
                namespace, existing.collection_uuid
            )));
        }

        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        for pair in chunks.windows(2) {
            if pair[0].range.overlaps(&pair[1].range) {
                return Err(Error::Config(format!(
                    "overlapping initial chunks {} and {} for {}",
                    pair[0].range, pair[1].range, namespace
                )));
            }
        }

        let routing = CollectionRouting {
            namespace: namespace.to_string(),
            collection_uuid,
            epoch: 1,
            chunks,
        };
        self.version = Self::CURRENT_VERSION;
        self.collections
            .insert(namespace.to_string(), routing.clone());
        Ok(routing)
    }

    pub fn drop_collection(&mut self, namespace: &str) -> bool {
        self.collections.remove(namespace).is_some()
    }

    /// Epoch-guarded, migration-id-idempotent ownership transfer.
    ///
    /// Returns the outcome plus whether the state changed (so callers
    /// persisting the state can skip no-op writes).
    pub fn reassign(&mut self, request: &ReassignRequest) -> (ReassignOutcome, bool) {
        let id = request.migration_id.to_string();
        match self.migration_outcomes.get(&id).map(|r| r.outcome) {
            Some(RecordedOutcome::Committed { epoch }) => {
                return (ReassignOutcome::AlreadyApplied(epoch), false)
            }
            Some(RecordedOutcome::Aborted) => {
                return (ReassignOutcome::Conflict(ConflictReason::ExplicitAbort), false)
            }
            None => {}
        }

        let conflict = match self.collections.get(&request.namespace) {
            None => Some(ConflictReason::CollectionDropped),
            Some(routing) if routing.collection_uuid != request.collection_uuid => {
                Some(ConflictReason::CollectionDropped)
            }
            Some(routing) if routing.epoch != request.expected_epoch => {
                Some(ConflictReason::StaleEpoch {
                    expected: request.expected_epoch,
                    actual: routing.epoch,
                })
            }
            Some(routing) => {
                let containing = routing
                    .chunks
                    .iter()
                    .position(|c| c.range.contains_range(&request.range));
                match containing {
                    Some(idx) if routing.chunks[idx].owner == request.from => None,
                    Some(idx) => Some(ConflictReason::OwnershipMismatch(format!(
                        "{} is owned by {}, not {}",
                        request.range, routing.chunks[idx].owner, request.from
                    ))),
                    None => Some(ConflictReason::OwnershipMismatch(format!(
                        "{} does not lie within a single chunk",
                        request.range
                    ))),
                }
            }
        };

        if let Some(reason) = conflict {
            self.record(id, RecordedOutcome::Aborted);
            return (ReassignOutcome::Conflict(reason), true);
        }

        let routing = match self.collections.get_mut(&request.namespace) {
            Some(routing) => routing,
            None => return (ReassignOutcome::Conflict(ConflictReason::CollectionDropped), false),
        };
        let idx = match routing
            .chunks
            .iter()
            .position(|c| c.range.contains_range(&request.range))
        {
            Some(idx) => idx,
            None => {
                return (
                    ReassignOutcome::Conflict(ConflictReason::OwnershipMismatch(
                        request.range.to_string(),
                    )),
                    false,
                )
            }
        };

        // split the containing chunk into up to three pieces
        let original = routing.chunks.remove(idx);
        let mut pieces = Vec::with_capacity(3);
        if original.range.min < request.range.min {
            pieces.push(ChunkOwnership::new(
                KeyRange::new(original.range.min.clone(), request.range.min.clone()),
                original.owner.clone(),
            ));
        }
        pieces.push(ChunkOwnership::new(
            request.range.clone(),
            request.to.clone(),
        ));
        if request.range.max < original.range.max {
            pieces.push(ChunkOwnership::new(
                KeyRange::new(request.range.max.clone(), original.range.max.clone()),
                original.owner,
            ));
        }
        for (offset, piece) in pieces.into_iter().enumerate() {
            routing.chunks.insert(idx + offset, piece);
        }

        routing.epoch += 1;
        let epoch = routing.epoch;
        self.record(id, RecordedOutcome::Committed { epoch });
        (ReassignOutcome::Committed(epoch), true)
    }

    pub fn lookup(&self, migration_id: MigrationId) -> MigrationOutcome {
        self.migration_outcomes
            .get(&migration_id.to_string())
            .map(|r| MigrationOutcome::from(r.outcome))
            .unwrap_or(MigrationOutcome::Unknown)
    }

    /// Record an abort unless the migration already committed. Returns the
    /// outcome now in force and whether the state changed.
    pub fn abort(&mut self, migration_id: MigrationId) -> (MigrationOutcome, bool) {
        let id = migration_id.to_string();
        match self.migration_outcomes.get(&id) {
            Some(recorded) => (recorded.outcome.into(), false),
            None => {
                self.record(id, RecordedOutcome::Aborted);
                (MigrationOutcome::Aborted, true)
            }
        }
    }

    /// Record an outcome and expire those past the retention window
    fn record(&mut self, id: String, outcome: RecordedOutcome) {
        let now = Utc::now();
        self.prune_outcomes(now - chrono::Duration::days(Self::OUTCOME_RETENTION_DAYS));
        self.migration_outcomes.insert(
            id,
            OutcomeRecord {
                outcome,
                recorded_at: now,
            },
        );
    }

    /// Forget outcomes recorded before `cutoff`. Returns how many were dropped.
    pub fn prune_outcomes(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.migration_outcomes.len();
        self.migration_outcomes
            .retain(|_, record| record.recorded_at >= cutoff);
        before - self.migration_outcomes.len()
    }
}
