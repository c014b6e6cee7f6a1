//! Visibility fences for orphan deletion
//!
//! A deletion task may only start once no reader can still be routed to the
//! losing shard for the moved range. Two strategies are provided; each
//! scheduler uses exactly one.

use super::{FenceKind, RangeDeletionTask};
use crate::clock::BoundedClock;
use crate::routing::Epoch;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a handed-off task's orphans are invisible to all readers
pub trait VisibilityFence: Send + Sync + Debug {
    fn is_clear(&self, task: &RangeDeletionTask, clock: &BoundedClock) -> bool;

    fn kind(&self) -> FenceKind;
}

/// Clear once the maximum reader staleness (plus clock skew margin) has
/// elapsed since hand-off. Needs no reader cooperation.
#[derive(Debug, Clone)]
pub struct StalenessTimerFence {
    max_staleness: Duration,
}

impl StalenessTimerFence {
    pub fn new(max_staleness: Duration) -> Self {
        Self { max_staleness }
    }
}

impl VisibilityFence for StalenessTimerFence {
    fn is_clear(&self, task: &RangeDeletionTask, clock: &BoundedClock) -> bool {
        match task.handed_off_at {
            Some(at) => clock.has_elapsed(at, self.max_staleness),
            None => false,
        }
    }

    fn kind(&self) -> FenceKind {
        FenceKind::StalenessTimer
    }
}

/// Clear once no reader holds a pin on a routing epoch older than the
/// task's fence epoch for the task's namespace.
#[derive(Debug, Clone, Default)]
pub struct ReaderEpochFence {
    pins: ReaderPinRegistry,
}

impl ReaderEpochFence {
    pub fn new(pins: ReaderPinRegistry) -> Self {
        Self { pins }
    }
}

impl VisibilityFence for ReaderEpochFence {
    fn is_clear(&self, task: &RangeDeletionTask, _clock: &BoundedClock) -> bool {
        let Some(fence_epoch) = task.fence_epoch else {
            return false;
        };
        match self.pins.oldest_pinned(&task.namespace) {
            Some(oldest) => oldest >= fence_epoch,
            None => true,
        }
    }

    fn kind(&self) -> FenceKind {
        FenceKind::ReaderEpoch
    }
}

/// Registry of routing epochs readers are currently using.
///
/// Uses reference counting so overlapping readers pinning the same
/// epoch are handled correctly.
#[derive(Debug, Default, Clone)]
pub struct ReaderPinRegistry {
    /// (namespace, epoch) -> active readers
    pinned: Arc<RwLock<HashMap<(String, Epoch), usize>>>,
}

impl ReaderPinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `epoch` for `namespace` until the returned guard drops.
    pub fn pin(&self, namespace: &str, epoch: Epoch) -> ReaderPin {
        let key = (namespace.to_string(), epoch);
        *self.pinned.write().entry(key.clone()).or_insert(0) += 1;
        ReaderPin {
            pinned: Arc::clone(&self.pinned),
            key,
        }
    }

    /// Oldest epoch any reader of `namespace` still holds
    pub fn oldest_pinned(&self, namespace: &str) -> Option<Epoch> {
        self.pinned
            .read()
            .iter()
            .filter(|((ns, _), count)| ns == namespace && **count > 0)
            .map(|((_, epoch), _)| *epoch)
            .min()
    }

    /// Distinct (namespace, epoch) pairs currently pinned
    pub fn pinned_count(&self) -> usize {
        self.pinned.read().values().filter(|&&v| v > 0).count()
    }
}

/// RAII guard that releases a reader's epoch pin when dropped
#[derive(Debug)]
pub struct ReaderPin {
    pinned: Arc<RwLock<HashMap<(String, Epoch), usize>>>,
    key: (String, Epoch),
}

impl ReaderPin {
    pub fn epoch(&self) -> Epoch {
        self.key.1
    }
}

impl Drop for ReaderPin {
    fn drop(&mut self) {
        let mut pinned = self.pinned.write();
        if let Some(count) = pinned.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pinned.remove(&self.key);
            }
        }
    }
}
