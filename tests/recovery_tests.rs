//! Integration tests for restart recovery
//!
//! A shard "crashes" by losing its durable log mid-migration; it is then
//! restarted over the same storage engine and object store, and recovery
//! must finish the migration the way the routing catalog decided it.

mod harness;

use harness::{dense_key, Cluster, FlakyLog, NAMESPACE};
use rangemover::durable::{DocumentCollection, DocumentKind};
use rangemover::migration::{
    LifecycleState, MigrationCoordinatorDocument, MigrationId, MigrationResponse,
};
use rangemover::range_deleter::{MigrationSide, RangeDeletionTask};
use rangemover::routing::{
    KeyRange, MigrationOutcome, ReassignOutcome, ReassignRequest, RoutingCatalog, ShardKey,
};
use std::sync::Arc;
use uuid::Uuid;

fn first_hundred() -> KeyRange {
    KeyRange::from_u64(0, 100)
}

fn five_hundred_keys() -> impl Iterator<Item = ShardKey> {
    (0..100u64).flat_map(|k| (0..5u8).map(move |s| dense_key(k, s)))
}

async fn coordinator_documents(
    cluster: &Cluster,
    shard: &str,
) -> Vec<MigrationCoordinatorDocument> {
    DocumentCollection::new(cluster.log_for(shard), DocumentKind::Migrations)
        .list()
        .await
        .unwrap()
}

/// Restart every shard over its durable log and run recovery on each
async fn restart_and_recover(cluster: &Cluster) -> Vec<rangemover::migration::RecoveryReport> {
    for id in cluster.directory.ids() {
        cluster.start_shard(&id, cluster.log_for(&id));
    }
    let recovery = cluster.recovery();
    let mut reports = Vec::new();
    for id in cluster.directory.ids() {
        reports.push(recovery.recover(&cluster.shard(&id)).await.unwrap());
    }
    reports
}

#[tokio::test]
async fn test_crash_after_catalog_commit_before_local_decision() {
    let cluster = Cluster::new(&["a", "b"]).await;
    cluster.seed("a", five_hundred_keys()).await;

    // Initializing, Cloning, Blocking and Committing persist; Decided does not
    cluster.start_shard("a", Arc::new(FlakyLog::new(cluster.log_for("a"), 4)));
    let result = cluster
        .manager()
        .start_migration(cluster.request(first_hundred(), "a", "b"))
        .await;
    // the caller learns the catalog's answer even though the log lost it
    match result {
        Ok(MigrationResponse::Committed { epoch, .. }) => assert_eq!(epoch, 2),
        other => panic!("Expected Committed, got: {:?}", other),
    }

    // the catalog already moved ownership
    let routing = cluster.routing().await;
    assert_eq!(routing.epoch, 2);
    assert_eq!(routing.owner_for(&dense_key(1, 0)).unwrap().owner, "b");

    let pending = coordinator_documents(&cluster, "a").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].lifecycle_state, LifecycleState::Committing);
    assert_eq!(pending[0].decision, None);

    let reports = restart_and_recover(&cluster).await;
    assert_eq!(reports[0].migrations_resumed, 1);
    assert_eq!(reports[0].committed, 1);
    assert_eq!(reports[1].migrations_resumed, 0);

    cluster.drain_deleters().await;

    assert_eq!(cluster.count("a", &first_hundred()).await, 0);
    assert_eq!(cluster.count("b", &first_hundred()).await, 500);
    assert!(cluster.shard("a").range_deleter().tasks().is_empty());
    assert!(cluster.shard("b").range_deleter().tasks().is_empty());
    assert!(coordinator_documents(&cluster, "a").await.is_empty());
}

#[tokio::test]
async fn test_crash_before_commit_is_fenced_and_aborted() {
    let cluster = Cluster::new(&["a", "b"]).await;
    cluster.seed("a", five_hundred_keys()).await;

    // the Blocking transition is the first write lost
    cluster.start_shard("a", Arc::new(FlakyLog::new(cluster.log_for("a"), 2)));
    let result = cluster
        .manager()
        .start_migration(cluster.request(first_hundred(), "a", "b"))
        .await;
    assert!(
        matches!(result, Ok(MigrationResponse::Aborted { .. })),
        "expected a local abort, got {:?}",
        result
    );
    assert_eq!(cluster.routing().await.epoch, 1);

    let pending = coordinator_documents(&cluster, "a").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].lifecycle_state, LifecycleState::Cloning);
    let migration_id = pending[0].migration_id;

    let reports = restart_and_recover(&cluster).await;
    assert_eq!(reports[0].aborted, 1);

    // a late commit for the same id can no longer apply
    assert_eq!(
        cluster.catalog.lookup_migration_outcome(migration_id).await.unwrap(),
        MigrationOutcome::Aborted
    );
    let late = cluster
        .catalog
        .conditional_reassign_range(&ReassignRequest {
            namespace: NAMESPACE.to_string(),
            collection_uuid: cluster.collection_uuid,
            range: first_hundred(),
            from: "a".into(),
            to: "b".into(),
            expected_epoch: 1,
            migration_id,
        })
        .await
        .unwrap();
    assert!(matches!(late, ReassignOutcome::Conflict(_)));

    cluster.drain_deleters().await;
    assert_eq!(cluster.count("a", &first_hundred()).await, 500);
    assert_eq!(cluster.count("b", &first_hundred()).await, 0);
    assert!(cluster.shard("b").range_deleter().tasks().is_empty());
}

#[tokio::test]
async fn test_unrecoverable_document_does_not_block_the_rest() {
    let cluster = Cluster::new(&["a", "b"]).await;
    cluster.seed("a", five_hundred_keys()).await;

    cluster.start_shard("a", Arc::new(FlakyLog::new(cluster.log_for("a"), 4)));
    let response = cluster
        .manager()
        .start_migration(cluster.request(first_hundred(), "a", "b"))
        .await
        .unwrap();
    assert!(matches!(response, MigrationResponse::Committed { epoch: 2, .. }));

    // names a recipient this process has never heard of
    let stray = MigrationCoordinatorDocument::new(
        MigrationId::new(),
        cluster.collection_uuid,
        NAMESPACE,
        KeyRange::from_u64(500, 600),
        "a",
        "shard-unknown",
        1,
        chrono::Utc::now(),
    );
    DocumentCollection::<MigrationCoordinatorDocument>::new(
        cluster.log_for("a"),
        DocumentKind::Migrations,
    )
    .put(&stray.key(), &stray)
    .await
    .unwrap();

    let reports = restart_and_recover(&cluster).await;
    assert_eq!(reports[0].migrations_resumed, 1);
    assert_eq!(reports[0].committed, 1);
    assert_eq!(reports[0].failed, 1);
    assert_eq!(reports[1].failed, 0);

    cluster.drain_deleters().await;
    assert_eq!(cluster.count("a", &first_hundred()).await, 0);
    assert_eq!(cluster.count("b", &first_hundred()).await, 500);

    // the stray document is still there for the next pass
    let left = coordinator_documents(&cluster, "a").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].migration_id, stray.migration_id);
}

#[tokio::test]
async fn test_handed_off_tasks_survive_restart() {
    let cluster = Cluster::new(&["a", "b"]).await;
    cluster.seed("a", five_hundred_keys()).await;
    let response = cluster
        .manager()
        .start_migration(cluster.request(first_hundred(), "a", "b"))
        .await
        .unwrap();
    assert!(matches!(
        response,
        rangemover::migration::MigrationResponse::Committed { .. }
    ));

    // restart before the donor's orphans were deleted
    let reports = restart_and_recover(&cluster).await;
    assert_eq!(reports[0].deletion_tasks_loaded, 1);
    assert_eq!(reports[0].migrations_resumed, 0);
    assert_eq!(cluster.shard("a").range_deleter().outstanding(), 1);

    cluster.drain_deleters().await;
    assert_eq!(cluster.count("a", &first_hundred()).await, 0);
    assert_eq!(cluster.count("b", &first_hundred()).await, 500);
}

#[tokio::test]
async fn test_orphaned_reservations_follow_catalog_outcome() {
    let cluster = Cluster::new(&["a", "b"]).await;
    cluster.seed("a", five_hundred_keys()).await;
    cluster.seed("a", (100..200u64).map(ShardKey::from_u64)).await;

    let committed_id = MigrationId::new();
    let outcome = cluster
        .catalog
        .conditional_reassign_range(&ReassignRequest {
            namespace: NAMESPACE.to_string(),
            collection_uuid: cluster.collection_uuid,
            range: first_hundred(),
            from: "a".into(),
            to: "b".into(),
            expected_epoch: 1,
            migration_id: committed_id,
        })
        .await
        .unwrap();
    assert_eq!(outcome, ReassignOutcome::Committed(2));

    let unknown_id = MigrationId::new();
    let a = cluster.shard("a");
    let committed = RangeDeletionTask::reservation(
        Uuid::new_v4(),
        committed_id,
        MigrationSide::Donor,
        NAMESPACE,
        cluster.collection_uuid,
        first_hundred(),
        "a",
    );
    let unknown = RangeDeletionTask::reservation(
        Uuid::new_v4(),
        unknown_id,
        MigrationSide::Donor,
        NAMESPACE,
        cluster.collection_uuid,
        KeyRange::from_u64(100, 200),
        "a",
    );
    a.range_deleter().enqueue(committed.clone()).await.unwrap();
    a.range_deleter().enqueue(unknown.clone()).await.unwrap();

    let reports = restart_and_recover(&cluster).await;
    assert_eq!(reports[0].reservations_resolved, 2);

    let a = cluster.shard("a");
    let handed_off = a.range_deleter().task(committed.task_id).unwrap();
    assert_eq!(handed_off.fence_epoch, Some(2));
    assert!(a.range_deleter().task(unknown.task_id).is_none());
    assert_eq!(
        cluster.catalog.lookup_migration_outcome(unknown_id).await.unwrap(),
        MigrationOutcome::Aborted
    );

    cluster.drain_deleters().await;
    assert_eq!(cluster.count("a", &first_hundred()).await, 0);
    assert_eq!(cluster.count("a", &KeyRange::from_u64(100, 200)).await, 100);
}
