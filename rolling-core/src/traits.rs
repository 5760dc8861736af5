use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::{RunId, RunRecord, TaskFilter, TaskFingerprint, TaskRecord, TaskUpdate};
use crate::error::Result;

/// Durable document store holding task records, partitioned into named pools.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Insert every record whose id is not yet present in the pool.
    ///
    /// Either all new records become visible or none do. Returns the ids that
    /// were actually inserted.
    async fn insert_absent(&self, pool: &str, records: &[TaskRecord]) -> Result<Vec<TaskFingerprint>>;

    /// Select one record matching `filter` and apply `update` to it as a single
    /// atomic step. Returns the updated record.
    async fn find_one_and_update(
        &self,
        pool: &str,
        filter: &TaskFilter,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>>;

    async fn find(&self, pool: &str, filter: &TaskFilter) -> Result<Vec<TaskRecord>>;

    async fn delete_many(&self, pool: &str, filter: &TaskFilter) -> Result<u64>;
}

/// Append-mostly store of run records, grouped by experiment namespace.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    async fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>>;

    async fn list_run_ids(&self, namespace: &str) -> Result<Vec<RunId>>;

    /// A finished run produced for the given task, if one exists.
    async fn find_by_task(&self, namespace: &str, task_id: &TaskFingerprint) -> Result<Option<RunRecord>>;

    /// Add artifacts to a run. Keys that already exist are left untouched.
    async fn add_artifacts(&self, id: &RunId, artifacts: BTreeMap<String, Value>) -> Result<()>;

    async fn delete_namespace(&self, namespace: &str) -> Result<u64>;
}
