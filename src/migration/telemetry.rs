//! Migration metrics and recording helpers.

use super::LifecycleState;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::sync::Once;

fn describe() {
    static DESCRIBE: Once = Once::new();
    DESCRIBE.call_once(|| {
        describe_counter!(
            "rangemover_migrations_total",
            "Migrations finished, by outcome (committed, aborted, rejected, unresolved)"
        );
        describe_histogram!(
            "rangemover_migration_duration_seconds",
            Unit::Seconds,
            "Wall time from start to decision"
        );
        describe_histogram!(
            "rangemover_migration_critical_section_seconds",
            Unit::Seconds,
            "Time the donor blocked writes to the migrating range"
        );
        describe_counter!(
            "rangemover_migration_documents_cloned_total",
            Unit::Count,
            "Documents copied by bulk cloning"
        );
        describe_counter!(
            "rangemover_migration_changes_applied_total",
            Unit::Count,
            "Change records replayed on recipients"
        );
        describe_counter!(
            "rangemover_migration_clone_retries_total",
            "Transient cloner failures that were retried"
        );
        describe_counter!(
            "rangemover_migration_state_transitions_total",
            "Coordinator lifecycle transitions persisted"
        );
        describe_counter!(
            "rangemover_migration_commit_resolutions_total",
            "Commit outcomes resolved through lookup or the abort fence"
        );
        describe_gauge!(
            "rangemover_migrations_active",
            "Migrations currently registered with the manager"
        );
    });
}

pub(super) fn record_state(state: LifecycleState) {
    describe();
    counter!(
        "rangemover_migration_state_transitions_total",
        "state" => state.as_str()
    )
    .increment(1);
}

pub(super) fn record_outcome(outcome: &'static str, seconds: f64) {
    describe();
    counter!("rangemover_migrations_total", "outcome" => outcome).increment(1);
    histogram!("rangemover_migration_duration_seconds", "outcome" => outcome).record(seconds);
}

pub(super) fn record_critical_section(seconds: f64) {
    describe();
    histogram!("rangemover_migration_critical_section_seconds").record(seconds);
}

pub(super) fn record_documents_cloned(count: u64) {
    describe();
    counter!("rangemover_migration_documents_cloned_total").increment(count);
}

pub(super) fn record_changes_applied(count: u64) {
    describe();
    counter!("rangemover_migration_changes_applied_total").increment(count);
}

pub(super) fn record_clone_retry(operation: &'static str) {
    describe();
    counter!("rangemover_migration_clone_retries_total", "operation" => operation).increment(1);
}

pub(super) fn record_commit_resolution(result: &'static str) {
    describe();
    counter!("rangemover_migration_commit_resolutions_total", "result" => result).increment(1);
}

pub(super) fn set_active(count: usize) {
    describe();
    gauge!("rangemover_migrations_active").set(count as f64);
}
