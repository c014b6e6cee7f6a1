//! Migration coordinator: the donor-side state machine
//!
//! Every transition is persisted to the donor's durable log before its
//! action runs, so [`MigrationCoordinator::resume`] can finish a migration
//! from any crash point without re-running a resolved ownership transaction.

use super::cloner::{CloneRequest, ClonedMarker, RangeCloner};
use super::manager::MigrationTracker;
use super::telemetry;
use super::{
    AbortReason, Decision, LifecycleState, MigrationConfig, MigrationCoordinatorDocument,
    MigrationId, MigrationRequest, MigrationResponse,
};
use crate::durable::{DocumentCollection, DocumentKind};
use crate::range_deleter::WhenToClean;
use crate::routing::{
    Epoch, MigrationOutcome, ReassignOutcome, ReassignRequest, RoutingCatalog,
};
use crate::shard::{CriticalSectionGuard, SectionRelease, Shard};
use crate::{Error, Result};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolved result of the ownership transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Committed(Epoch),
    Aborted(AbortReason),
}

/// Find out what happened to a commit whose response was lost.
///
/// Looks the migration id up in the catalog; when nothing was recorded it
/// writes an abort fence so a delayed commit can never apply afterwards.
/// The transaction itself is never resubmitted.
pub(crate) async fn resolve_commit_outcome(
    catalog: &dyn RoutingCatalog,
    migration_id: MigrationId,
    config: &MigrationConfig,
) -> Result<Resolution> {
    let mut last_error = None;
    for attempt in 1..=config.commit_resolution_attempts {
        let lookup = async {
            match catalog.lookup_migration_outcome(migration_id).await? {
                MigrationOutcome::Committed(epoch) => Ok(Resolution::Committed(epoch)),
                MigrationOutcome::Aborted => Ok(Resolution::Aborted(AbortReason::ExplicitAbort)),
                MigrationOutcome::Unknown => match catalog.abort_migration(migration_id).await? {
                    MigrationOutcome::Committed(epoch) => Ok(Resolution::Committed(epoch)),
                    MigrationOutcome::Aborted => {
                        Ok(Resolution::Aborted(AbortReason::CommitOutcomeUnknown))
                    }
                    MigrationOutcome::Unknown => Err(Error::Internal(format!(
                        "abort fence for {} recorded no outcome",
                        migration_id
                    ))),
                },
            }
        };
        match tokio::time::timeout(config.commit_timeout, lookup).await {
            Ok(Ok(resolution)) => {
                telemetry::record_commit_resolution(match resolution {
                    Resolution::Committed(_) => "committed",
                    Resolution::Aborted(_) => "aborted",
                });
                info!(%migration_id, ?resolution, attempt, "Resolved commit outcome");
                return Ok(resolution);
            }
            Ok(Err(e)) => {
                warn!(%migration_id, attempt, error = %e, "Commit outcome lookup failed");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                warn!(%migration_id, attempt, "Commit outcome lookup timed out");
                last_error = Some(format!("lookup timed out after {:?}", config.commit_timeout));
            }
        }
        if attempt < config.commit_resolution_attempts {
            tokio::time::sleep(config.clone_backoff_for(attempt)).await;
        }
    }
    telemetry::record_commit_resolution("unresolved");
    Err(Error::AmbiguousCommitOutcome(format!(
        "migration {}: {}",
        migration_id,
        last_error.unwrap_or_else(|| "no lookup attempted".to_string())
    )))
}

/// Drives one migration from the donor's point of view
pub struct MigrationCoordinator {
    config: MigrationConfig,
    catalog: Arc<dyn RoutingCatalog>,
    donor: Arc<Shard>,
    recipient: Arc<Shard>,
    documents: DocumentCollection<MigrationCoordinatorDocument>,
    cloner: RangeCloner,
    tracker: Arc<MigrationTracker>,
}

impl MigrationCoordinator {
    pub fn new(
        config: MigrationConfig,
        catalog: Arc<dyn RoutingCatalog>,
        donor: Arc<Shard>,
        recipient: Arc<Shard>,
        tracker: Arc<MigrationTracker>,
    ) -> Self {
        Self {
            cloner: RangeCloner::new(config.clone()),
            documents: DocumentCollection::new(donor.log().clone(), DocumentKind::Migrations),
            config,
            catalog,
            donor,
            recipient,
            tracker,
        }
    }

    /// Run a migration to its decision.
    ///
    /// Returns `Rejected` if the preconditions fail before anything is
    /// persisted, `Aborted` for any failure before the commit point, and
    /// `Committed` once ownership moved. Failures to persist the decision or
    /// to clean up after it are left to recovery and never change the answer.
    pub async fn run(
        &self,
        migration_id: MigrationId,
        request: &MigrationRequest,
    ) -> Result<MigrationResponse> {
        let routing = match self.catalog.get_collection(&request.namespace).await? {
            Some(routing) => routing,
            None => {
                return Ok(MigrationResponse::Rejected(format!(
                    "namespace {} is not routed",
                    request.namespace
                )))
            }
        };
        let donor_owns_range = routing
            .chunks
            .iter()
            .any(|c| c.owner == self.donor.id() && c.range.contains_range(&request.range));
        if !donor_owns_range {
            return Ok(MigrationResponse::Rejected(format!(
                "{} does not own {} of {} at epoch {}",
                self.donor.id(),
                request.range,
                request.namespace,
                routing.epoch
            )));
        }
        match self.donor.store().collection_uuid(&request.namespace).await? {
            Some(uuid) if uuid == routing.collection_uuid => {}
            Some(uuid) => {
                return Ok(MigrationResponse::Rejected(format!(
                    "{} holds generation {} of {}, catalog has {}",
                    self.donor.id(),
                    uuid,
                    request.namespace,
                    routing.collection_uuid
                )))
            }
            None => {
                return Ok(MigrationResponse::Rejected(format!(
                    "{} has no collection {}",
                    self.donor.id(),
                    request.namespace
                )))
            }
        }

        let mut doc = MigrationCoordinatorDocument::new(
            migration_id,
            routing.collection_uuid,
            &request.namespace,
            request.range.clone(),
            self.donor.id(),
            self.recipient.id(),
            routing.epoch,
            self.donor.clock().now(),
        );
        self.persist(&doc).await?;
        info!(
            %migration_id,
            namespace = %doc.namespace,
            range = %doc.range,
            donor = %doc.donor,
            recipient = %doc.recipient,
            epoch = doc.expected_epoch,
            "Migration started"
        );

        let cancel = self.tracker.cancel_token();
        let mut section: Option<CriticalSectionGuard> = None;
        let resolution = match self.run_to_commit(&mut doc, &mut section, &cancel).await {
            Ok(blocking_deadline) => match self.commit(&doc, blocking_deadline).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    // queued writes re-check ownership, so unblocking them is safe
                    if let Some(guard) = section.take() {
                        guard.release(SectionRelease::Aborted);
                    }
                    error!(
                        %migration_id,
                        error = %e,
                        "Commit outcome unresolved, leaving migration to recovery"
                    );
                    return Err(e);
                }
            },
            Err(failure) => {
                let reason = if cancel.is_cancelled() {
                    AbortReason::Cancelled
                } else {
                    failure
                };
                warn!(%migration_id, %reason, "Migration aborting before commit");
                Resolution::Aborted(reason)
            }
        };

        // the catalog agrees with this answer from here on, whatever the log says
        let response = match &resolution {
            Resolution::Committed(epoch) => MigrationResponse::Committed {
                migration_id,
                epoch: *epoch,
            },
            Resolution::Aborted(reason) => MigrationResponse::Aborted {
                migration_id,
                reason: reason.clone(),
            },
        };

        match self.decide(&mut doc, resolution, section.take()).await {
            Ok(()) => {
                if let Err(e) = self.finish_cleanup(&mut doc).await {
                    warn!(
                        %migration_id,
                        error = %e,
                        "Cleanup hand-off failed after decision, recovery will finish it"
                    );
                }
            }
            Err(e) => {
                error!(
                    %migration_id,
                    error = %e,
                    ?response,
                    "Decision not persisted, recovery will resolve it from the catalog"
                );
            }
        }

        Ok(response)
    }

    /// Everything up to the commit submission. Any error here is a local
    /// abort. Returns the deadline by which the critical section must end.
    async fn run_to_commit(
        &self,
        doc: &mut MigrationCoordinatorDocument,
        section: &mut Option<CriticalSectionGuard>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Instant, AbortReason> {
        let abort = |e: Error| AbortReason::from_error(&e);
        let namespace = doc.namespace.clone();
        let range = doc.range.clone();

        // recipient joins the collection under the same generation
        self.recipient
            .store()
            .create_collection(&namespace, doc.collection_uuid)
            .await
            .map_err(abort)?;

        let waited = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.recipient.range_deleter().wait_for_clean(
                &namespace,
                &range,
                self.config.overlapping_deletion_timeout,
            ) => result,
        };
        match waited {
            Ok(()) => {}
            Err(Error::DeadlineExceeded { .. }) => {
                return Err(AbortReason::OverlappingRangeDeletion)
            }
            Err(e) => return Err(abort(e)),
        }

        self.donor
            .range_deleter()
            .enqueue(doc.donor_reservation())
            .await
            .map_err(abort)?;
        self.recipient
            .range_deleter()
            .enqueue(doc.recipient_reservation())
            .await
            .map_err(abort)?;

        self.transition(doc, LifecycleState::Cloning)
            .await
            .map_err(abort)?;
        let request = CloneRequest {
            migration_id: doc.migration_id,
            namespace: &namespace,
            collection_uuid: doc.collection_uuid,
            range: &range,
            donor: &self.donor,
            recipient: &self.recipient,
        };
        let mut marker: ClonedMarker = self
            .cloner
            .clone_range(&request, self.tracker.progress(), cancel)
            .await
            .map_err(abort)?;

        self.transition(doc, LifecycleState::Blocking)
            .await
            .map_err(abort)?;
        let blocking_deadline = Instant::now() + self.config.critical_section_timeout;
        let guard = self
            .donor
            .enter_critical_section(
                &namespace,
                &range,
                self.config.critical_section_queue_limit,
            )
            .await
            .map_err(abort)?;
        *section = Some(guard);

        let drained = tokio::time::timeout_at(
            blocking_deadline,
            self.cloner.drain_remaining(
                &request,
                &mut marker,
                self.tracker.progress(),
                blocking_deadline,
                cancel,
            ),
        )
        .await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(Error::ClonerAborted(_))) if Instant::now() >= blocking_deadline => {
                return Err(self.blocking_timeout())
            }
            Ok(Err(e)) => return Err(abort(e)),
            Err(_) => return Err(self.blocking_timeout()),
        }
        debug!(
            migration_id = %doc.migration_id,
            last_applied_seq = marker.last_applied_seq,
            "Recipient caught up inside critical section"
        );

        // last point at which cancellation is honoured
        if cancel.is_cancelled() {
            return Err(AbortReason::Cancelled);
        }
        self.transition(doc, LifecycleState::Committing)
            .await
            .map_err(abort)?;
        Ok(blocking_deadline)
    }

    fn blocking_timeout(&self) -> AbortReason {
        AbortReason::from_error(&Error::DeadlineExceeded {
            operation: "critical section",
            limit: self.config.critical_section_timeout,
        })
    }

    /// Submit the ownership transaction once and resolve its outcome.
    ///
    /// Writes stay blocked while this runs, so submission and lookups share
    /// what is left of the critical section budget. Past `deadline` the
    /// outcome is settled with a single abort fence.
    async fn commit(
        &self,
        doc: &MigrationCoordinatorDocument,
        deadline: Instant,
    ) -> Result<Resolution> {
        let request = ReassignRequest {
            namespace: doc.namespace.clone(),
            collection_uuid: doc.collection_uuid,
            range: doc.range.clone(),
            from: doc.donor.clone(),
            to: doc.recipient.clone(),
            expected_epoch: doc.expected_epoch,
            migration_id: doc.migration_id,
        };
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(self.config.commit_timeout);
        let submitted =
            tokio::time::timeout(budget, self.catalog.conditional_reassign_range(&request)).await;

        match submitted {
            Ok(Ok(ReassignOutcome::Committed(epoch)))
            | Ok(Ok(ReassignOutcome::AlreadyApplied(epoch))) => Ok(Resolution::Committed(epoch)),
            Ok(Ok(ReassignOutcome::Conflict(reason))) => {
                info!(migration_id = %doc.migration_id, %reason, "Ownership transaction refused");
                Ok(Resolution::Aborted(reason.into()))
            }
            Ok(Err(e)) => {
                warn!(
                    migration_id = %doc.migration_id,
                    error = %e,
                    "Ownership transaction response lost, looking up outcome"
                );
                self.resolve_before(doc.migration_id, deadline).await
            }
            Err(_) => {
                warn!(
                    migration_id = %doc.migration_id,
                    timeout_ms = budget.as_millis() as u64,
                    "Ownership transaction timed out, looking up outcome"
                );
                self.resolve_before(doc.migration_id, deadline).await
            }
        }
    }

    async fn resolve_before(
        &self,
        migration_id: MigrationId,
        deadline: Instant,
    ) -> Result<Resolution> {
        let lookup = resolve_commit_outcome(self.catalog.as_ref(), migration_id, &self.config);
        if let Ok(resolved) = tokio::time::timeout_at(deadline, lookup).await {
            return resolved;
        }

        warn!(%migration_id, "Critical section deadline reached, fencing commit");
        let fenced = tokio::time::timeout(
            self.config.commit_timeout,
            self.catalog.abort_migration(migration_id),
        )
        .await;
        let resolution = match fenced {
            Ok(Ok(MigrationOutcome::Committed(epoch))) => Resolution::Committed(epoch),
            Ok(Ok(MigrationOutcome::Aborted)) => Resolution::Aborted(self.blocking_timeout()),
            Ok(Ok(MigrationOutcome::Unknown)) => {
                return Err(Error::Internal(format!(
                    "abort fence for {} recorded no outcome",
                    migration_id
                )))
            }
            Ok(Err(e)) => {
                return Err(Error::AmbiguousCommitOutcome(format!(
                    "migration {}: abort fence failed: {}",
                    migration_id, e
                )))
            }
            Err(_) => {
                return Err(Error::AmbiguousCommitOutcome(format!(
                    "migration {}: abort fence timed out after {:?}",
                    migration_id, self.config.commit_timeout
                )))
            }
        };
        telemetry::record_commit_resolution(match resolution {
            Resolution::Committed(_) => "committed",
            Resolution::Aborted(_) => "aborted",
        });
        info!(%migration_id, ?resolution, "Commit outcome settled by abort fence");
        Ok(resolution)
    }

    /// Fix the decision durably, then unblock queued writes
    async fn decide(
        &self,
        doc: &mut MigrationCoordinatorDocument,
        resolution: Resolution,
        section: Option<CriticalSectionGuard>,
    ) -> Result<()> {
        match resolution {
            Resolution::Committed(epoch) => doc.decide_committed(epoch)?,
            Resolution::Aborted(reason) => doc.decide_aborted(reason)?,
        }
        doc.advance(LifecycleState::Decided)?;

        let persisted = self.persist_with_retry(doc).await;
        let release = match (doc.decision, doc.committed_epoch) {
            (Some(Decision::Committed), Some(epoch)) => SectionRelease::Committed {
                recipient: doc.recipient.clone(),
                epoch,
            },
            _ => SectionRelease::Aborted,
        };
        if let Some(guard) = section {
            telemetry::record_critical_section(guard.elapsed().as_secs_f64());
            guard.release(release);
        }
        self.tracker.publish(doc);
        persisted?;
        info!(
            migration_id = %doc.migration_id,
            decision = ?doc.decision,
            epoch = ?doc.committed_epoch,
            reason = ?doc.abort_reason,
            "Migration decided"
        );
        Ok(())
    }

    /// Resume a migration found on the donor's log after a restart.
    /// Returns the decision it ended with.
    pub async fn resume(&self, mut doc: MigrationCoordinatorDocument) -> Result<Decision> {
        self.tracker.publish(&doc);
        if doc.lifecycle_state == LifecycleState::Done {
            self.documents.remove(&doc.key()).await?;
            return doc.decision.ok_or_else(|| {
                Error::Internal(format!(
                    "migration {} is done without a decision",
                    doc.migration_id
                ))
            });
        }

        if doc.decision.is_none() {
            info!(
                migration_id = %doc.migration_id,
                state = %doc.lifecycle_state,
                "Resolving undecided migration"
            );
            let resolution =
                resolve_commit_outcome(self.catalog.as_ref(), doc.migration_id, &self.config)
                    .await?;
            self.decide(&mut doc, resolution, None).await?;
        } else if doc.lifecycle_state < LifecycleState::Decided {
            doc.advance(LifecycleState::Decided)?;
            self.persist_with_retry(&doc).await?;
        }

        self.finish_cleanup(&mut doc).await?;
        doc.decision.ok_or_else(|| {
            Error::Internal(format!("migration {} finished without a decision", doc.migration_id))
        })
    }

    /// Hand the losing side's reservation to its scheduler, drop the winning
    /// side's reservation, then retire the coordinator document.
    async fn finish_cleanup(&self, doc: &mut MigrationCoordinatorDocument) -> Result<()> {
        let (loser, mut task, winner, winner_task_id, fence_epoch, when) =
            match (doc.decision, doc.committed_epoch) {
                (Some(Decision::Committed), Some(epoch)) => (
                    &self.donor,
                    doc.donor_reservation(),
                    &self.recipient,
                    doc.recipient_task_id,
                    epoch,
                    WhenToClean::Delayed(self.config.orphan_cleanup_delay),
                ),
                (Some(Decision::Aborted), _) => (
                    &self.recipient,
                    doc.recipient_reservation(),
                    &self.donor,
                    doc.donor_task_id,
                    doc.expected_epoch,
                    WhenToClean::Immediate,
                ),
                (decision, epoch) => {
                    return Err(Error::Internal(format!(
                        "migration {} cannot clean up: decision {:?}, epoch {:?}",
                        doc.migration_id, decision, epoch
                    )))
                }
            };

        // an earlier attempt may already have handed off; keep its fence start
        let already_handed_off = loser
            .range_deleter()
            .task(task.task_id)
            .is_some_and(|existing| !existing.is_reservation());
        if !already_handed_off {
            task.hand_off(fence_epoch, when, loser.clock().now());
            loser.range_deleter().enqueue(task).await?;
        }
        winner.range_deleter().forget(winner_task_id).await?;

        doc.advance(LifecycleState::Done)?;
        self.persist(doc).await?;
        self.documents.remove(&doc.key()).await?;
        self.tracker.publish(doc);
        info!(
            migration_id = %doc.migration_id,
            orphans_on = %loser.id(),
            "Migration cleanup handed off"
        );
        Ok(())
    }

    async fn transition(
        &self,
        doc: &mut MigrationCoordinatorDocument,
        state: LifecycleState,
    ) -> Result<()> {
        doc.advance(state)?;
        self.persist(doc).await?;
        debug!(migration_id = %doc.migration_id, %state, "Migration state persisted");
        Ok(())
    }

    async fn persist(&self, doc: &MigrationCoordinatorDocument) -> Result<()> {
        self.documents.put(&doc.key(), doc).await?;
        telemetry::record_state(doc.lifecycle_state);
        self.tracker.publish(doc);
        Ok(())
    }

    async fn persist_with_retry(&self, doc: &MigrationCoordinatorDocument) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.persist(doc).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.commit_resolution_attempts {
                        error!(
                            migration_id = %doc.migration_id,
                            error = %e,
                            "Failed to persist migration decision"
                        );
                        return Err(e);
                    }
                    let backoff = self.config.clone_backoff_for(attempt);
                    warn!(
                        migration_id = %doc.migration_id,
                        attempt,
                        error = %e,
                        "Persisting migration decision failed, retrying"
                    );
                    tokio::time::sleep(backoff.min(Duration::from_secs(1))).await;
                }
            }
        }
    }
}
