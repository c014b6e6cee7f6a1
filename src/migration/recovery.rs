//! Startup recovery of migrations and range deletions on one shard

use super::coordinator::{resolve_commit_outcome, MigrationCoordinator, Resolution};
use super::manager::MigrationTracker;
use super::{Decision, MigrationConfig, MigrationCoordinatorDocument};
use crate::durable::{DocumentCollection, DocumentKind};
use crate::range_deleter::{MigrationSide, RangeDeletionTask, WhenToClean};
use crate::routing::RoutingCatalog;
use crate::shard::{Shard, ShardDirectory};
use crate::Result;

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What one recovery pass found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Deletion tasks (reservations included) loaded into the scheduler
    pub deletion_tasks_loaded: usize,
    /// Coordinator documents picked up and driven to completion
    pub migrations_resumed: usize,
    pub committed: usize,
    pub aborted: usize,
    /// Donor reservations left behind without a coordinator document
    pub reservations_resolved: usize,
    /// Migrations or reservations that could not be recovered this pass;
    /// they stay on disk for the next one
    pub failed: usize,
}

/// Brings a shard's migration state back to a consistent point after a
/// restart. Run it before the shard accepts new migrations: an in-flight
/// migration in the same process would be fenced as undecided.
pub struct RecoveryManager {
    config: MigrationConfig,
    catalog: Arc<dyn RoutingCatalog>,
    directory: Arc<ShardDirectory>,
}

impl RecoveryManager {
    pub fn new(
        config: MigrationConfig,
        catalog: Arc<dyn RoutingCatalog>,
        directory: Arc<ShardDirectory>,
    ) -> Self {
        Self {
            config,
            catalog,
            directory,
        }
    }

    pub async fn recover(&self, shard: &Arc<Shard>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            deletion_tasks_loaded: shard.range_deleter().recover().await?,
            ..Default::default()
        };

        let documents: DocumentCollection<MigrationCoordinatorDocument> =
            DocumentCollection::new(shard.log().clone(), DocumentKind::Migrations);
        let pending = documents.list().await?;
        let known: HashSet<_> = pending.iter().map(|doc| doc.migration_id).collect();

        for doc in pending {
            if doc.donor != shard.id() {
                warn!(
                    shard = %shard.id(),
                    migration_id = %doc.migration_id,
                    donor = %doc.donor,
                    "Ignoring coordinator document owned by another donor"
                );
                continue;
            }
            let migration_id = doc.migration_id;
            let state = doc.lifecycle_state;
            match self.resume(shard, doc).await {
                Ok(decision) => {
                    info!(
                        shard = %shard.id(),
                        %migration_id,
                        %state,
                        ?decision,
                        "Recovered migration"
                    );
                    report.migrations_resumed += 1;
                    match decision {
                        Decision::Committed => report.committed += 1,
                        Decision::Aborted => report.aborted += 1,
                    }
                }
                Err(e) => {
                    error!(
                        shard = %shard.id(),
                        %migration_id,
                        %state,
                        error = %e,
                        "Failed to recover migration, leaving it for the next pass"
                    );
                    report.failed += 1;
                }
            }
        }

        // recipient-side reservations belong to the donor's coordinator
        let orphaned: Vec<_> = shard
            .range_deleter()
            .tasks()
            .into_iter()
            .filter(|t| {
                t.is_reservation()
                    && t.side == MigrationSide::Donor
                    && t.owner_before_deletion == shard.id()
                    && !known.contains(&t.migration_id)
            })
            .collect();
        for task in orphaned {
            let migration_id = task.migration_id;
            let task_id = task.task_id;
            match self.resolve_reservation(shard, task).await {
                Ok(()) => report.reservations_resolved += 1,
                Err(e) => {
                    error!(
                        shard = %shard.id(),
                        %migration_id,
                        %task_id,
                        error = %e,
                        "Failed to resolve orphaned reservation, leaving it for the next pass"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(shard = %shard.id(), ?report, "Recovery finished");
        Ok(report)
    }

    async fn resume(
        &self,
        shard: &Arc<Shard>,
        doc: MigrationCoordinatorDocument,
    ) -> Result<Decision> {
        let recipient = self.directory.get(&doc.recipient)?;
        let coordinator = MigrationCoordinator::new(
            self.config.clone(),
            self.catalog.clone(),
            shard.clone(),
            recipient,
            Arc::new(MigrationTracker::for_document(&doc)),
        );
        coordinator.resume(doc).await
    }

    /// Hand off or drop a donor reservation according to the catalog
    async fn resolve_reservation(
        &self,
        shard: &Arc<Shard>,
        mut task: RangeDeletionTask,
    ) -> Result<()> {
        let resolution =
            resolve_commit_outcome(self.catalog.as_ref(), task.migration_id, &self.config).await?;
        match resolution {
            Resolution::Committed(epoch) => {
                task.hand_off(
                    epoch,
                    WhenToClean::Delayed(self.config.orphan_cleanup_delay),
                    shard.clock().now(),
                );
                info!(
                    shard = %shard.id(),
                    migration_id = %task.migration_id,
                    task_id = %task.task_id,
                    epoch,
                    "Handing off reservation of committed migration"
                );
                shard.range_deleter().enqueue(task).await
            }
            Resolution::Aborted(reason) => {
                info!(
                    shard = %shard.id(),
                    migration_id = %task.migration_id,
                    task_id = %task.task_id,
                    %reason,
                    "Dropping reservation of aborted migration"
                );
                shard.range_deleter().forget(task.task_id).await
            }
        }
    }
}
