//! Command surface: start, observe and abort migrations

use super::cloner::CloneProgress;
use super::coordinator::MigrationCoordinator;
use super::telemetry;
use super::{
    AbortReason, Decision, LifecycleState, MigrationConfig, MigrationCoordinatorDocument,
    MigrationId, MigrationRequest, MigrationResponse,
};
use crate::routing::{Epoch, KeyRange, RoutingCatalog, ShardId};
use crate::shard::ShardDirectory;
use crate::Result;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Point-in-time view of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub migration_id: MigrationId,
    pub namespace: String,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    /// `None` until the coordinator document is first written
    pub lifecycle_state: Option<LifecycleState>,
    pub decision: Option<Decision>,
    pub committed_epoch: Option<Epoch>,
    pub abort_reason: Option<AbortReason>,
    pub docs_cloned: u64,
    pub mods_applied: u64,
    /// Still registered with the manager
    pub active: bool,
}

/// Shared state between a running coordinator and its observers
#[derive(Debug)]
pub struct MigrationTracker {
    migration_id: MigrationId,
    request: MigrationRequest,
    document: RwLock<Option<MigrationCoordinatorDocument>>,
    progress: CloneProgress,
    cancel: CancellationToken,
}

impl MigrationTracker {
    pub fn new(migration_id: MigrationId, request: MigrationRequest) -> Self {
        Self {
            migration_id,
            request,
            document: RwLock::new(None),
            progress: CloneProgress::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Tracker for a migration picked up from the durable log
    pub fn for_document(doc: &MigrationCoordinatorDocument) -> Self {
        let tracker = Self::new(
            doc.migration_id,
            MigrationRequest {
                namespace: doc.namespace.clone(),
                range: doc.range.clone(),
                donor: doc.donor.clone(),
                recipient: doc.recipient.clone(),
            },
        );
        tracker.publish(doc);
        tracker
    }

    pub fn progress(&self) -> &CloneProgress {
        &self.progress
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(super) fn publish(&self, doc: &MigrationCoordinatorDocument) {
        *self.document.write() = Some(doc.clone());
    }

    pub fn status(&self, active: bool) -> MigrationStatus {
        let document = self.document.read();
        let doc = document.as_ref();
        MigrationStatus {
            migration_id: self.migration_id,
            namespace: self.request.namespace.clone(),
            range: self.request.range.clone(),
            donor: self.request.donor.clone(),
            recipient: self.request.recipient.clone(),
            lifecycle_state: doc.map(|d| d.lifecycle_state),
            decision: doc.and_then(|d| d.decision),
            committed_epoch: doc.and_then(|d| d.committed_epoch),
            abort_reason: doc.and_then(|d| d.abort_reason.clone()),
            docs_cloned: self.progress.docs_cloned(),
            mods_applied: self.progress.mods_applied(),
            active,
        }
    }
}

type ActiveMigrations = Arc<Mutex<HashMap<MigrationId, Arc<MigrationTracker>>>>;

/// Removes a migration from the active set when the run ends, however it ends
struct Registration {
    active: ActiveMigrations,
    migration_id: MigrationId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        active.remove(&self.migration_id);
        telemetry::set_active(active.len());
    }
}

/// In-process registry and entry point for migrations.
///
/// At most one migration may be active per overlapping range of a
/// namespace; a second request for an overlapping range is rejected.
pub struct MigrationManager {
    config: MigrationConfig,
    catalog: Arc<dyn RoutingCatalog>,
    directory: Arc<ShardDirectory>,
    active: ActiveMigrations,
    finished: DashMap<MigrationId, MigrationStatus>,
}

impl MigrationManager {
    pub fn new(
        config: MigrationConfig,
        catalog: Arc<dyn RoutingCatalog>,
        directory: Arc<ShardDirectory>,
    ) -> Self {
        Self {
            config,
            catalog,
            directory,
            active: Arc::new(Mutex::new(HashMap::new())),
            finished: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Start a migration under a fresh id and wait for its decision
    pub async fn start_migration(&self, request: MigrationRequest) -> Result<MigrationResponse> {
        self.start_migration_with_id(MigrationId::new(), request)
            .await
    }

    /// Start a migration under a caller-chosen id, so the caller can observe
    /// or abort it while it runs
    pub async fn start_migration_with_id(
        &self,
        migration_id: MigrationId,
        request: MigrationRequest,
    ) -> Result<MigrationResponse> {
        let started = Instant::now();
        if let Some(reason) = self.validate(&request) {
            info!(%migration_id, %reason, "Migration rejected");
            telemetry::record_outcome("rejected", 0.0);
            return Ok(MigrationResponse::Rejected(reason));
        }
        let (donor, recipient) = match (
            self.directory.get(&request.donor),
            self.directory.get(&request.recipient),
        ) {
            (Ok(donor), Ok(recipient)) => (donor, recipient),
            (Err(e), _) | (_, Err(e)) => {
                telemetry::record_outcome("rejected", 0.0);
                return Ok(MigrationResponse::Rejected(e.to_string()));
            }
        };

        let tracker = Arc::new(MigrationTracker::new(migration_id, request.clone()));
        let _registration = match self.register(migration_id, &request, tracker.clone()) {
            Ok(registration) => registration,
            Err(reason) => {
                info!(%migration_id, %reason, "Migration rejected");
                telemetry::record_outcome("rejected", 0.0);
                return Ok(MigrationResponse::Rejected(reason));
            }
        };

        let coordinator = MigrationCoordinator::new(
            self.config.clone(),
            self.catalog.clone(),
            donor,
            recipient,
            tracker.clone(),
        );
        let result = coordinator.run(migration_id, &request).await;

        let seconds = started.elapsed().as_secs_f64();
        match &result {
            Ok(MigrationResponse::Committed { epoch, .. }) => {
                telemetry::record_outcome("committed", seconds);
                info!(%migration_id, epoch, "Migration committed");
            }
            Ok(MigrationResponse::Aborted { reason, .. }) => {
                telemetry::record_outcome("aborted", seconds);
                info!(%migration_id, %reason, "Migration aborted");
            }
            Ok(MigrationResponse::Rejected(reason)) => {
                telemetry::record_outcome("rejected", seconds);
                info!(%migration_id, %reason, "Migration rejected");
            }
            Err(e) => {
                telemetry::record_outcome("unresolved", seconds);
                warn!(%migration_id, error = %e, "Migration ended without a local decision");
            }
        }
        self.finished.insert(migration_id, tracker.status(false));
        result
    }

    fn validate(&self, request: &MigrationRequest) -> Option<String> {
        if request.range.is_empty() {
            return Some(format!("range {} is empty", request.range));
        }
        if request.donor == request.recipient {
            return Some(format!("donor and recipient are both {}", request.donor));
        }
        None
    }

    fn register(
        &self,
        migration_id: MigrationId,
        request: &MigrationRequest,
        tracker: Arc<MigrationTracker>,
    ) -> std::result::Result<Registration, String> {
        let mut active = self.active.lock();
        if let Some(existing) = active.values().find(|t| {
            t.request.namespace == request.namespace && t.request.range.overlaps(&request.range)
        }) {
            return Err(format!(
                "migration {} is already moving {} of {}",
                existing.migration_id, existing.request.range, existing.request.namespace
            ));
        }
        active.insert(migration_id, tracker);
        telemetry::set_active(active.len());
        Ok(Registration {
            active: self.active.clone(),
            migration_id,
        })
    }

    /// Status of a running or finished migration
    pub fn get_migration_status(&self, migration_id: MigrationId) -> Option<MigrationStatus> {
        if let Some(tracker) = self.active.lock().get(&migration_id) {
            return Some(tracker.status(true));
        }
        self.finished.get(&migration_id).map(|s| s.value().clone())
    }

    /// Ask a running migration to abort. Honoured only until the ownership
    /// transaction is submitted. Returns false if the migration is not active.
    pub fn abort_migration(&self, migration_id: MigrationId) -> bool {
        match self.active.lock().get(&migration_id) {
            Some(tracker) => {
                info!(%migration_id, "Abort requested");
                tracker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_migrations(&self) -> Vec<MigrationStatus> {
        let mut statuses: Vec<_> = self
            .active
            .lock()
            .values()
            .map(|t| t.status(true))
            .collect();
        statuses.sort_by_key(|s| s.migration_id);
        statuses
    }
}
