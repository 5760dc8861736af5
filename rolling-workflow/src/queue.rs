//! Lease-based task queue over a shared [`TaskBackend`].
//!
//! Every state change goes through the backend's atomic find-and-update, so
//! the queue itself holds no task state and any number of processes can share
//! one pool.

use chrono::Utc;
use rolling_core::domain::{
    RunId, TaskDefinition, TaskFilter, TaskFingerprint, TaskRecord, TaskStatus, TaskUpdate, WorkerId,
};
use rolling_core::{CoreError, Result, TaskBackend};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::metrics::QueueMetrics;

const DEFAULT_CLAIM_ATTEMPTS: u32 = 5;
const CLAIM_BACKOFF: Duration = Duration::from_millis(10);

/// Outcome of a bulk submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSummary {
    /// Fingerprints of every submitted definition, in submission order, without duplicates.
    pub ids: Vec<TaskFingerprint>,
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn TaskBackend>,
    pool: String,
    claim_attempts: u32,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn TaskBackend>, pool: impl Into<String>) -> Self {
        Self {
            backend,
            pool: pool.into(),
            claim_attempts: DEFAULT_CLAIM_ATTEMPTS,
        }
    }

    /// How many times a claim is retried after losing a race before giving up.
    pub fn with_claim_attempts(mut self, attempts: u32) -> Self {
        self.claim_attempts = attempts.max(1);
        self
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Submit definitions as WAITING tasks. Fingerprints already in the pool
    /// are skipped, so submitting the same definitions again is a no-op.
    pub async fn create(&self, definitions: &[TaskDefinition]) -> Result<CreateSummary> {
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let record = TaskRecord::new(definition.clone());
            if seen.insert(record.id.clone()) {
                records.push(record);
            }
        }

        let inserted = self.backend.insert_absent(&self.pool, &records).await?;
        let summary = CreateSummary {
            ids: records.into_iter().map(|r| r.id).collect(),
            inserted: inserted.len(),
            skipped: definitions.len() - inserted.len(),
        };

        tracing::info!(
            "Submitted {} tasks to pool {} ({} new, {} already present)",
            definitions.len(),
            self.pool,
            summary.inserted,
            summary.skipped
        );
        Ok(summary)
    }

    /// Claim one WAITING task, or a RUNNING task whose lease has run out.
    ///
    /// Returns `None` when nothing is claimable. Lost races are retried
    /// internally and never reach the caller.
    pub async fn claim(&self, worker_id: &WorkerId, lease: Duration) -> Result<Option<TaskRecord>> {
        let lease = to_chrono(lease)?;

        for attempt in 1..=self.claim_attempts {
            let now = Utc::now();
            let update = TaskUpdate::Claim {
                owner: worker_id.clone(),
                lease_expiry: now + lease,
            };

            match self
                .backend
                .find_one_and_update(&self.pool, &TaskFilter::claimable(now), &update, now)
                .await
            {
                Ok(Some(record)) => {
                    tracing::debug!(
                        "Worker {} claimed task {} (retry {})",
                        worker_id,
                        record.id.short(),
                        record.retry_count
                    );
                    QueueMetrics::claimed(&self.pool);
                    return Ok(Some(record));
                }
                Ok(None) => return Ok(None),
                Err(e) if e.is_conflict() => {
                    tracing::debug!("Claim attempt {} in pool {} lost a race: {}", attempt, self.pool, e);
                    tokio::time::sleep(CLAIM_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            "Giving up claiming from pool {} after {} contended attempts",
            self.pool,
            self.claim_attempts
        );
        Ok(None)
    }

    /// Extend the lease. Returns `false` without effect if the worker no longer
    /// owns the task.
    pub async fn heartbeat(&self, task_id: &TaskFingerprint, worker_id: &WorkerId, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let update = TaskUpdate::Heartbeat {
            lease_expiry: now + to_chrono(lease)?,
        };
        let updated = self
            .backend
            .find_one_and_update(&self.pool, &TaskFilter::owned(task_id, worker_id), &update, now)
            .await?;
        Ok(updated.is_some())
    }

    pub async fn complete(&self, task_id: &TaskFingerprint, worker_id: &WorkerId, result_ref: RunId) -> Result<()> {
        self.update_owned(task_id, worker_id, TaskUpdate::Complete { result_ref })
            .await?;
        QueueMetrics::completed(&self.pool, TaskStatus::Done.as_str());
        tracing::info!("Task {} done with run {}", task_id.short(), result_ref);
        Ok(())
    }

    /// Record a result that still needs a finishing step; see [`TaskQueue::finalize`].
    pub async fn complete_partial(
        &self,
        task_id: &TaskFingerprint,
        worker_id: &WorkerId,
        result_ref: RunId,
    ) -> Result<()> {
        self.update_owned(task_id, worker_id, TaskUpdate::CompletePartial { result_ref })
            .await?;
        QueueMetrics::completed(&self.pool, TaskStatus::PartialDone.as_str());
        tracing::info!("Task {} partially done with run {}", task_id.short(), result_ref);
        Ok(())
    }

    /// Move a PARTIAL_DONE task to DONE. Returns `false` if the task was not
    /// PARTIAL_DONE, for instance because another worker finalized it first.
    pub async fn finalize(&self, task_id: &TaskFingerprint) -> Result<bool> {
        let now = Utc::now();
        let filter = TaskFilter::id(task_id).with_statuses(vec![TaskStatus::PartialDone]);
        let updated = self
            .backend
            .find_one_and_update(&self.pool, &filter, &TaskUpdate::Finalize, now)
            .await?;

        if updated.is_some() {
            QueueMetrics::completed(&self.pool, TaskStatus::Done.as_str());
        }
        Ok(updated.is_some())
    }

    /// Give a task back. Retryable failures return it to WAITING with an
    /// incremented retry count; otherwise it ends FAILED.
    pub async fn fail(
        &self,
        task_id: &TaskFingerprint,
        worker_id: &WorkerId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<()> {
        if retryable {
            self.update_owned(task_id, worker_id, TaskUpdate::Requeue { error })
                .await?;
            QueueMetrics::requeued(&self.pool);
            tracing::info!("Task {} returned to the queue", task_id.short());
        } else {
            self.update_owned(task_id, worker_id, TaskUpdate::Fail { error }).await?;
            QueueMetrics::failed(&self.pool);
            tracing::warn!("Task {} failed permanently", task_id.short());
        }
        Ok(())
    }

    /// Delete every matching record. Irreversible.
    pub async fn remove(&self, filter: &TaskFilter) -> Result<u64> {
        let removed = self.backend.delete_many(&self.pool, filter).await?;
        tracing::info!("Removed {} tasks from pool {}", removed, self.pool);
        Ok(removed)
    }

    pub async fn get(&self, task_id: &TaskFingerprint) -> Result<Option<TaskRecord>> {
        Ok(self
            .backend
            .find(&self.pool, &TaskFilter::id(task_id))
            .await?
            .into_iter()
            .next())
    }

    pub async fn query(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        self.backend.find(&self.pool, filter).await
    }

    /// Number of tasks in each status, in [`TaskStatus::ALL`] order.
    pub async fn summary(&self) -> Result<Vec<(TaskStatus, usize)>> {
        let records = self.backend.find(&self.pool, &TaskFilter::all()).await?;
        Ok(TaskStatus::ALL
            .iter()
            .map(|status| (*status, records.iter().filter(|r| r.status == *status).count()))
            .collect())
    }

    /// Put matching tasks that are not already WAITING back to WAITING so they
    /// run again. Returns how many were reset.
    pub async fn reset(&self, filter: &TaskFilter) -> Result<u64> {
        let targets = self.backend.find(&self.pool, filter).await?;
        let resettable: Vec<TaskStatus> = TaskStatus::ALL
            .into_iter()
            .filter(|s| *s != TaskStatus::Waiting)
            .collect();

        let mut reset = 0;
        for record in targets.iter().filter(|r| r.status != TaskStatus::Waiting) {
            let now = Utc::now();
            let filter = TaskFilter::id(&record.id).with_statuses(resettable.clone());
            if self
                .backend
                .find_one_and_update(&self.pool, &filter, &TaskUpdate::Reset, now)
                .await?
                .is_some()
            {
                reset += 1;
            }
        }

        tracing::info!("Reset {} tasks in pool {}", reset, self.pool);
        Ok(reset)
    }

    /// Poll until none of `ids` is WAITING or RUNNING, then return their
    /// records. A cancelled token returns the records as they stand.
    pub async fn wait_until_settled(
        &self,
        ids: &[TaskFingerprint],
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskRecord>> {
        let filter = TaskFilter::ids(ids.to_vec());
        loop {
            let records = self.backend.find(&self.pool, &filter).await?;
            let pending = records
                .iter()
                .filter(|r| matches!(r.status, TaskStatus::Waiting | TaskStatus::Running))
                .count();
            if pending == 0 {
                return Ok(records);
            }

            tracing::debug!("Waiting for {} tasks in pool {} to settle", pending, self.pool);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(records),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Apply an update that requires `worker_id` to hold the task, telling an
    /// unknown task apart from one owned by someone else.
    async fn update_owned(&self, task_id: &TaskFingerprint, worker_id: &WorkerId, update: TaskUpdate) -> Result<TaskRecord> {
        let now = Utc::now();
        let filter = TaskFilter::owned(task_id, worker_id);
        if let Some(record) = self
            .backend
            .find_one_and_update(&self.pool, &filter, &update, now)
            .await?
        {
            return Ok(record);
        }

        match self.get(task_id).await? {
            Some(_) => Err(CoreError::ownership(task_id, worker_id)),
            None => Err(CoreError::NotFound(format!(
                "Task {} not found in pool {}",
                task_id, self.pool
            ))),
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::Validation(format!("lease duration out of range: {}", e)))
}
