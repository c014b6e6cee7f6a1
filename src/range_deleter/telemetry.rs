//! Range deleter metrics and recording helpers.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::sync::Once;

fn describe() {
    static DESCRIBE: Once = Once::new();
    DESCRIBE.call_once(|| {
        describe_counter!(
            "rangemover_range_deleter_tasks_total",
            "Range deletion tasks finished, by outcome"
        );
        describe_counter!(
            "rangemover_range_deleter_documents_deleted_total",
            Unit::Count,
            "Orphaned documents deleted"
        );
        describe_histogram!(
            "rangemover_range_deleter_batch_duration_seconds",
            Unit::Seconds,
            "Duration of one deletion batch"
        );
        describe_counter!(
            "rangemover_range_deleter_retries_total",
            "Task executions that ended in a retry"
        );
        describe_gauge!(
            "rangemover_range_deleter_queue_depth",
            "Tasks known to the scheduler, including pending ones"
        );
        describe_counter!(
            "rangemover_range_deleter_deferred_total",
            "Runnable tasks deferred because all workers were busy"
        );
    });
}

pub(super) fn record_task_finished(shard: &str, outcome: &'static str) {
    describe();
    counter!(
        "rangemover_range_deleter_tasks_total",
        "shard" => shard.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub(super) fn record_batch(shard: &str, deleted: u64, seconds: f64) {
    describe();
    counter!(
        "rangemover_range_deleter_documents_deleted_total",
        "shard" => shard.to_string()
    )
    .increment(deleted);
    histogram!(
        "rangemover_range_deleter_batch_duration_seconds",
        "shard" => shard.to_string()
    )
    .record(seconds);
}

pub(super) fn record_retry(shard: &str) {
    describe();
    counter!("rangemover_range_deleter_retries_total", "shard" => shard.to_string()).increment(1);
}

pub(super) fn record_deferred(shard: &str, count: usize) {
    describe();
    counter!("rangemover_range_deleter_deferred_total", "shard" => shard.to_string())
        .increment(count as u64);
}

pub(super) fn record_queue_depth(shard: &str, depth: usize) {
    describe();
    gauge!("rangemover_range_deleter_queue_depth", "shard" => shard.to_string()).set(depth as f64);
}
