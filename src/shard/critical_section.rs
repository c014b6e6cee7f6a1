//! Write-blocking critical sections
//!
//! While a migration drains its last changes and commits, writes to the
//! migrating range queue here instead of being applied. Each section has a
//! bounded waiter queue, and dropping the guard without an explicit release
//! unblocks waiters as if the migration had aborted.

use crate::routing::{Epoch, KeyRange, ShardId, ShardKey};
use crate::{Error, Result};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// How a critical section ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionRelease {
    /// Ownership unchanged; queued writes proceed on this shard
    Aborted,
    /// Range now belongs to `recipient`; queued writes will be redirected
    Committed { recipient: ShardId, epoch: Epoch },
}

#[derive(Debug, Clone)]
enum SectionState {
    Blocking,
    Released(SectionRelease),
}

#[derive(Debug)]
struct ActiveSection {
    id: u64,
    namespace: String,
    range: KeyRange,
    state: watch::Sender<SectionState>,
    queued: Arc<AtomicUsize>,
    queue_limit: usize,
}

/// Active critical sections of one shard
#[derive(Debug, Default)]
pub struct CriticalSectionRegistry {
    sections: Mutex<Vec<Arc<ActiveSection>>>,
    next_id: AtomicU64,
}

impl CriticalSectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start blocking writes to `range`. Fails if an overlapping section is
    /// already active.
    pub fn enter(
        self: &Arc<Self>,
        namespace: &str,
        range: &KeyRange,
        queue_limit: usize,
    ) -> Result<CriticalSectionGuard> {
        let mut sections = self.sections.lock();
        if let Some(existing) = sections
            .iter()
            .find(|s| s.namespace == namespace && s.range.overlaps(range))
        {
            return Err(Error::MigrationConflict(format!(
                "critical section already active for {} {}",
                namespace, existing.range
            )));
        }

        let (state, _) = watch::channel(SectionState::Blocking);
        let section = Arc::new(ActiveSection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            namespace: namespace.to_string(),
            range: range.clone(),
            state,
            queued: Arc::new(AtomicUsize::new(0)),
            queue_limit,
        });
        sections.push(section.clone());
        info!(namespace, %range, "Entered critical section");

        Ok(CriticalSectionGuard {
            registry: self.clone(),
            section,
            entered_at: Instant::now(),
            released: false,
        })
    }

    /// Waiter for the section covering `key`, or `None` if writes to `key`
    /// are not blocked. Fails with `WriteQueueFull` once the queue is at its limit.
    pub fn waiter_for(&self, namespace: &str, key: &ShardKey) -> Result<Option<SectionWaiter>> {
        let sections = self.sections.lock();
        let Some(section) = sections
            .iter()
            .find(|s| s.namespace == namespace && s.range.contains(key))
        else {
            return Ok(None);
        };

        let queued = section.queued.fetch_add(1, Ordering::AcqRel);
        if queued >= section.queue_limit {
            section.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::WriteQueueFull {
                namespace: namespace.to_string(),
            });
        }
        Ok(Some(SectionWaiter {
            state: section.state.subscribe(),
            queued: section.queued.clone(),
        }))
    }

    pub fn active_count(&self) -> usize {
        self.sections.lock().len()
    }

    fn remove(&self, id: u64) {
        self.sections.lock().retain(|s| s.id != id);
    }
}

/// A write parked behind a critical section
#[derive(Debug)]
pub struct SectionWaiter {
    state: watch::Receiver<SectionState>,
    queued: Arc<AtomicUsize>,
}

impl SectionWaiter {
    /// Wait until the section is released
    pub async fn wait(mut self) -> SectionRelease {
        let released = self
            .state
            .wait_for(|state| matches!(state, SectionState::Released(_)))
            .await
            .map(|state| state.clone());
        match released {
            Ok(SectionState::Released(release)) => release,
            // sender gone without a release means the guard was dropped mid-flight
            _ => SectionRelease::Aborted,
        }
    }
}

impl Drop for SectionWaiter {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds a critical section open; releasing (or dropping) unblocks writers
#[derive(Debug)]
pub struct CriticalSectionGuard {
    registry: Arc<CriticalSectionRegistry>,
    section: Arc<ActiveSection>,
    entered_at: Instant,
    released: bool,
}

impl CriticalSectionGuard {
    pub fn namespace(&self) -> &str {
        &self.section.namespace
    }

    pub fn range(&self) -> &KeyRange {
        &self.section.range
    }

    /// Writes currently parked behind this section
    pub fn queued_writes(&self) -> usize {
        self.section.queued.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub fn release(mut self, outcome: SectionRelease) {
        self.release_inner(outcome);
    }

    fn release_inner(&mut self, outcome: SectionRelease) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.remove(self.section.id);
        info!(
            namespace = %self.section.namespace,
            range = %self.section.range,
            ?outcome,
            blocked_ms = self.entered_at.elapsed().as_millis() as u64,
            queued = self.queued_writes(),
            "Released critical section"
        );
        self.section.state.send_replace(SectionState::Released(outcome));
    }
}

impl Drop for CriticalSectionGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                namespace = %self.section.namespace,
                range = %self.section.range,
                "Critical section dropped without release, unblocking writes"
            );
            self.release_inner(SectionRelease::Aborted);
        }
    }
}
