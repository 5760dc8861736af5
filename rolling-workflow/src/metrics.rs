//! Counters for task lifecycle and collection passes.
//!
//! Recording is a no-op until a recorder (for example the Prometheus exporter
//! installed by the lab binary) is registered.

use metrics::{counter, describe_counter, Unit};
use std::sync::Once;

static DESCRIBED: Once = Once::new();

/// Registers descriptions for all counters. Safe to call more than once.
pub fn register_metric_descriptions() {
    DESCRIBED.call_once(|| {
        describe_counter!(
            "rolling_tasks_claimed_total",
            Unit::Count,
            "Total number of tasks claimed by workers"
        );
        describe_counter!(
            "rolling_tasks_completed_total",
            Unit::Count,
            "Total number of tasks completed, by final status"
        );
        describe_counter!(
            "rolling_tasks_requeued_total",
            Unit::Count,
            "Total number of failed attempts returned to the queue"
        );
        describe_counter!(
            "rolling_tasks_failed_total",
            Unit::Count,
            "Total number of tasks that failed terminally"
        );
        describe_counter!(
            "rolling_collect_records_total",
            Unit::Count,
            "Run records seen by collection passes, by outcome"
        );
    });
}

/// Task lifecycle counters, labelled by pool.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn claimed(pool: &str) {
        counter!("rolling_tasks_claimed_total", "pool" => pool.to_string()).increment(1);
    }

    pub fn completed(pool: &str, status: &str) {
        counter!(
            "rolling_tasks_completed_total",
            "pool" => pool.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn requeued(pool: &str) {
        counter!("rolling_tasks_requeued_total", "pool" => pool.to_string()).increment(1);
    }

    pub fn failed(pool: &str) {
        counter!("rolling_tasks_failed_total", "pool" => pool.to_string()).increment(1);
    }
}

/// Records the outcome counts of one collection pass.
pub fn collect_records(namespace: &str, outcome: &'static str, count: usize) {
    counter!(
        "rolling_collect_records_total",
        "namespace" => namespace.to_string(),
        "outcome" => outcome
    )
    .increment(count as u64);
}
