use futures::future::try_join_all;
use rolling_core::domain::{RunRecord, TaskDefinition, TaskFilter, TaskRecord};
use rolling_core::{ExperimentStore, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::collect::{Collection, GroupKey, RunCollector};
use crate::executor::TrainingExecutor;
use crate::gen::{task_generator, TaskGen};
use crate::group::GroupReducer;
use crate::queue::TaskQueue;
use crate::trainer::{Trainer, TrainerConfig};

/// Counts removed by [`RollingPipeline::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub tasks_removed: u64,
    pub runs_removed: u64,
}

/// One rolling retraining experiment: a task pool and the run namespace fed
/// from it.
pub struct RollingPipeline {
    queue: TaskQueue,
    store: Arc<dyn ExperimentStore>,
    executor: Arc<dyn TrainingExecutor>,
    namespace: String,
    tasks: Vec<TaskDefinition>,
    generators: Vec<Box<dyn TaskGen>>,
    trainer_config: TrainerConfig,
    workers: usize,
    cancel: CancellationToken,
}

impl RollingPipeline {
    pub fn new(
        queue: TaskQueue,
        store: Arc<dyn ExperimentStore>,
        executor: Arc<dyn TrainingExecutor>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            store,
            executor,
            namespace: namespace.into(),
            tasks: Vec::new(),
            generators: Vec::new(),
            trainer_config: TrainerConfig::default(),
            workers: 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskDefinition>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_generator(mut self, generator: impl TaskGen + 'static) -> Self {
        self.generators.push(Box::new(generator));
        self
    }

    pub fn with_trainer_config(mut self, config: TrainerConfig) -> Self {
        self.trainer_config = config;
        self
    }

    /// Number of workers `train` runs side by side in this process.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Delete every task in the pool and every run in the namespace. There is
    /// no undo.
    pub async fn reset(&self) -> Result<ResetReport> {
        tracing::warn!(
            "Resetting pool {} and namespace {}",
            self.queue.pool(),
            self.namespace
        );
        let tasks_removed = self.queue.remove(&TaskFilter::all()).await?;
        let runs_removed = self.store.delete_namespace(&self.namespace).await?;

        let report = ResetReport {
            tasks_removed,
            runs_removed,
        };
        tracing::info!("Reset removed {:?}", report);
        Ok(report)
    }

    /// Expand the base tasks with every configured generator.
    pub fn generate(&self) -> Result<Vec<TaskDefinition>> {
        let generators: Vec<&dyn TaskGen> = self.generators.iter().map(|g| g.as_ref()).collect();
        let tasks = task_generator(&self.tasks, &generators)?;
        tracing::info!(
            "Generated {} tasks from {} templates",
            tasks.len(),
            self.tasks.len()
        );
        Ok(tasks)
    }

    pub fn trainer(&self) -> Trainer {
        Trainer::new(
            self.queue.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            self.namespace.clone(),
            self.trainer_config.clone(),
        )
        .with_cancellation(self.cancel.clone())
    }

    /// Submit `tasks` and train them to completion. In delayed mode the
    /// finishing step runs as well, so every task ends DONE or FAILED.
    pub async fn train(&self, tasks: &[TaskDefinition]) -> Result<Vec<TaskRecord>> {
        let trainers: Vec<Trainer> = (0..self.workers).map(|_| self.trainer()).collect();
        let mut settled = try_join_all(trainers.iter().map(|t| t.train(tasks))).await?;
        let records = settled.pop().unwrap_or_default();
        if !self.trainer_config.delayed {
            return Ok(records);
        }

        let ids: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        match trainers.first() {
            Some(trainer) => trainer.end_train(&ids).await,
            None => Ok(records),
        }
    }

    pub async fn collect<K, F, R>(&self, key_fn: K, filter_fn: F, reducer: &R) -> Result<Collection<R::Output>>
    where
        K: Fn(&RunRecord) -> Result<GroupKey>,
        F: Fn(&RunRecord) -> Result<bool>,
        R: GroupReducer + ?Sized,
    {
        RunCollector::new(Arc::clone(&self.store), self.namespace.clone())
            .collect(key_fn, filter_fn, reducer)
            .await
    }

    /// Reset, generate, train, then collect.
    pub async fn run_all<K, F, R>(&self, key_fn: K, filter_fn: F, reducer: &R) -> Result<Collection<R::Output>>
    where
        K: Fn(&RunRecord) -> Result<GroupKey>,
        F: Fn(&RunRecord) -> Result<bool>,
        R: GroupReducer + ?Sized,
    {
        self.reset().await?;
        let tasks = self.generate()?;
        let records = self.train(&tasks).await?;
        tracing::info!("Trained {} tasks", records.len());
        self.collect(key_fn, filter_fn, reducer).await
    }
}
