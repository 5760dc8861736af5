//! The worker loop: claim, train, record, complete.

use rolling_core::domain::{RunRecord, TaskDefinition, TaskFilter, TaskFingerprint, TaskRecord, TaskStatus, WorkerId};
use rolling_core::{CoreError, ExperimentStore, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::executor::{TrainContext, TrainOutput, TrainingExecutor};
use crate::queue::TaskQueue;

// ===== Configuration =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Stop as soon as nothing is claimable.
    #[default]
    Batch,
    /// Keep polling until cancelled.
    Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    #[serde(with = "millis")]
    pub lease: Duration,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Failed attempts allowed before a task is marked FAILED for good.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub mode: RunMode,
    /// Stop at PARTIAL_DONE and leave the finishing step to [`Trainer::end_train`].
    pub delayed: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            max_retries: 3,
            poll_interval: Duration::from_secs(5),
            mode: RunMode::Batch,
            delayed: false,
        }
    }
}

impl TrainerConfig {
    pub fn with_lease(mut self, lease: Duration, heartbeat_interval: Duration) -> Self {
        self.lease = lease;
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_mode(mut self, mode: RunMode, poll_interval: Duration) -> Self {
        self.mode = mode;
        self.poll_interval = poll_interval;
        self
    }

    pub fn delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed;
        self
    }

    /// A lease must outlive at least one heartbeat, or every attempt would lose
    /// its task between renewals.
    pub fn validate(&self) -> Result<()> {
        if self.lease.is_zero() {
            return Err(CoreError::Validation("lease must be positive".to_string()));
        }
        if self.heartbeat_interval >= self.lease {
            return Err(CoreError::Validation(format!(
                "heartbeat interval {:?} must be shorter than the lease {:?}",
                self.heartbeat_interval, self.lease
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ===== Report =====

/// What one worker did during a call to [`Trainer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub claimed: usize,
    pub completed: usize,
    /// Completed from a run that already existed, without training again.
    pub reused: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Attempts given up after losing the task to another worker.
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Reused,
    Requeued,
    Failed,
    Abandoned,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.reused += other.reused;
        self.requeued += other.requeued;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Reused => self.reused += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }
}

enum Attempt {
    Finished(Result<TrainOutput>),
    LostLease,
    Cancelled,
}

// ===== Trainer =====

pub struct Trainer {
    queue: TaskQueue,
    store: Arc<dyn ExperimentStore>,
    executor: Arc<dyn TrainingExecutor>,
    namespace: String,
    worker_id: WorkerId,
    config: TrainerConfig,
    cancel: CancellationToken,
}

impl Trainer {
    pub fn new(
        queue: TaskQueue,
        store: Arc<dyn ExperimentStore>,
        executor: Arc<dyn TrainingExecutor>,
        namespace: impl Into<String>,
        config: TrainerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            executor,
            namespace: namespace.into(),
            worker_id: WorkerId::generate(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Submit `definitions` and work the pool until every one of them is
    /// settled. Tasks other workers hold are waited for, and taken over if
    /// their lease runs out. Returns the submitted tasks' records.
    pub async fn train(&self, definitions: &[TaskDefinition]) -> Result<Vec<TaskRecord>> {
        self.config.validate()?;
        let summary = self.queue.create(definitions).await?;
        let filter = TaskFilter::ids(summary.ids);
        let mut report = WorkerReport::default();

        loop {
            report.merge(self.run_mode(RunMode::Batch).await?);

            let records = self.queue.query(&filter).await?;
            let pending = records.iter().filter(|r| !r.status.is_terminal()).count();
            if pending == 0 || self.cancel.is_cancelled() {
                tracing::info!("Worker {} finished: {:?}", self.worker_id, report);
                return Ok(records);
            }

            tracing::debug!(
                "Worker {} waiting for {} tasks held by other workers",
                self.worker_id,
                pending
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Run the worker loop in the configured mode.
    pub async fn run(&self) -> Result<WorkerReport> {
        self.config.validate()?;
        self.run_mode(self.config.mode).await
    }

    async fn run_mode(&self, mode: RunMode) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        tracing::info!(
            "Worker {} polling pool {} ({:?} mode)",
            self.worker_id,
            self.queue.pool(),
            mode
        );

        while !self.cancel.is_cancelled() {
            match self.queue.claim(&self.worker_id, self.config.lease).await? {
                Some(record) => {
                    report.claimed += 1;
                    let outcome = self.process(record).await?;
                    report.record(outcome);
                }
                None if mode == RunMode::Batch => break,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, record: TaskRecord) -> Result<Outcome> {
        // A run left behind by an earlier attempt that died before completing
        // the task is reused instead of training again.
        if let Some(run) = self.store.find_by_task(&self.namespace, &record.id).await? {
            tracing::info!(
                "Task {} already has run {}, completing without training",
                record.id.short(),
                run.id
            );
            return self.finish(&record, run, Outcome::Reused).await;
        }

        let ctx = TrainContext {
            namespace: self.namespace.clone(),
            task_id: record.id.clone(),
            task: record.definition.clone(),
            worker_id: self.worker_id.clone(),
            attempt: record.retry_count,
        };

        match self.train_with_heartbeat(&ctx).await {
            Attempt::Finished(Ok(output)) => {
                // only the current owner may record a run
                if !self.queue.heartbeat(&record.id, &self.worker_id, self.config.lease).await? {
                    tracing::warn!(
                        "Worker {} lost task {} before recording its run, dropping the result",
                        self.worker_id,
                        record.id.short()
                    );
                    return Ok(Outcome::Abandoned);
                }
                let run = RunRecord::new(&self.namespace, record.definition.clone(), self.worker_id.clone())
                    .with_artifacts(output.artifacts);
                self.store.create_run(&run).await?;
                self.finish(&record, run, Outcome::Completed).await
            }
            Attempt::Finished(Err(e)) => {
                let retryable = record.retry_count < self.config.max_retries;
                tracing::warn!(
                    "Training task {} failed (attempt {}, retryable: {}): {}",
                    record.id.short(),
                    record.retry_count,
                    retryable,
                    e
                );
                let error = e.to_string();
                let outcome = if retryable { Outcome::Requeued } else { Outcome::Failed };
                self.give_back(&record, retryable, error, outcome).await
            }
            Attempt::LostLease => {
                tracing::warn!("Worker {} lost task {}, abandoning attempt", self.worker_id, record.id.short());
                Ok(Outcome::Abandoned)
            }
            Attempt::Cancelled => {
                tracing::info!("Worker {} cancelled during task {}", self.worker_id, record.id.short());
                let error = "worker shut down".to_string();
                match self.give_back(&record, true, error, Outcome::Requeued).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        // the lease will run out on its own
                        tracing::warn!("Could not return task {}: {}", record.id.short(), e);
                        Ok(Outcome::Abandoned)
                    }
                }
            }
        }
    }

    /// Run the executor while a ticker keeps the lease alive.
    async fn train_with_heartbeat(&self, ctx: &TrainContext) -> Attempt {
        let train = self.executor.train(ctx);
        tokio::pin!(train);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut renewed = tokio::time::Instant::now();

        loop {
            tokio::select! {
                result = &mut train => return Attempt::Finished(result),
                _ = self.cancel.cancelled() => return Attempt::Cancelled,
                _ = ticker.tick() => {
                    match self.queue.heartbeat(&ctx.task_id, &self.worker_id, self.config.lease).await {
                        Ok(true) => renewed = tokio::time::Instant::now(),
                        Ok(false) => return Attempt::LostLease,
                        // past the lease another worker may already hold the task
                        Err(e) if renewed.elapsed() >= self.config.lease => {
                            tracing::warn!("Heartbeat for task {} failed past its lease: {}", ctx.task_id.short(), e);
                            return Attempt::LostLease;
                        }
                        Err(e) => tracing::warn!("Heartbeat for task {} failed: {}", ctx.task_id.short(), e),
                    }
                }
            }
        }
    }

    async fn finish(&self, record: &TaskRecord, run: RunRecord, outcome: Outcome) -> Result<Outcome> {
        let result = if self.config.delayed {
            self.queue.complete_partial(&record.id, &self.worker_id, run.id).await
        } else {
            self.queue.complete(&record.id, &self.worker_id, run.id).await
        };
        self.absorb_ownership(record, result.map(|_| outcome))
    }

    async fn give_back(&self, record: &TaskRecord, retryable: bool, error: String, outcome: Outcome) -> Result<Outcome> {
        let result = self
            .queue
            .fail(&record.id, &self.worker_id, retryable, Some(error))
            .await;
        self.absorb_ownership(record, result.map(|_| outcome))
    }

    /// Losing a task to another worker ends this attempt, not the loop.
    fn absorb_ownership(&self, record: &TaskRecord, result: Result<Outcome>) -> Result<Outcome> {
        match result {
            Err(CoreError::Ownership { .. }) => {
                tracing::warn!(
                    "Worker {} no longer owns task {}, dropping its result",
                    self.worker_id,
                    record.id.short()
                );
                Ok(Outcome::Abandoned)
            }
            other => other,
        }
    }

    /// Run the finishing step for every PARTIAL_DONE task among `ids` and move
    /// it to DONE. Tasks whose step fails stay PARTIAL_DONE for a later call.
    pub async fn end_train(&self, ids: &[TaskFingerprint]) -> Result<Vec<TaskRecord>> {
        let filter = TaskFilter::ids(ids.to_vec()).with_statuses(vec![TaskStatus::PartialDone]);
        let pending = self.queue.query(&filter).await?;
        tracing::info!("Finishing {} partially trained tasks", pending.len());

        for record in pending {
            let Some(run_id) = record.result_ref else {
                continue;
            };
            let run = self
                .store
                .get_run(&run_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("Run {} for task {} not found", run_id, record.id)))?;

            let ctx = TrainContext {
                namespace: self.namespace.clone(),
                task_id: record.id.clone(),
                task: record.definition.clone(),
                worker_id: self.worker_id.clone(),
                attempt: record.retry_count,
            };

            match self.executor.end_train(&ctx, &run).await {
                Ok(artifacts) => {
                    self.store.add_artifacts(&run.id, artifacts).await?;
                    if !self.queue.finalize(&record.id).await? {
                        tracing::debug!("Task {} was finalized elsewhere", record.id.short());
                    }
                }
                Err(e) => {
                    tracing::warn!("Finishing task {} failed: {}", record.id.short(), e);
                }
            }
        }

        self.queue.query(&TaskFilter::ids(ids.to_vec())).await
    }
}
