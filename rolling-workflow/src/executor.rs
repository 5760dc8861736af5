use async_trait::async_trait;
use rolling_core::domain::{RunRecord, TaskDefinition, TaskFingerprint, WorkerId};
use rolling_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything a training executor gets to know about the attempt it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainContext {
    pub namespace: String,
    pub task_id: TaskFingerprint,
    pub task: TaskDefinition,
    pub worker_id: WorkerId,
    /// Retry count of the task when it was claimed.
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainOutput {
    pub artifacts: BTreeMap<String, Value>,
}

impl TrainOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, name: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(name.into(), value);
        self
    }
}

/// The model fitting procedure, supplied by the caller.
///
/// An attempt may be retried after a crash or a lost lease, so `train` must be
/// safe to run more than once for the same task.
#[async_trait]
pub trait TrainingExecutor: Send + Sync {
    async fn train(&self, ctx: &TrainContext) -> Result<TrainOutput>;

    /// Finishing step for delayed training, run once the first stage of every
    /// task has produced its run. Returned artifacts are added to the run;
    /// ones the run already has are kept.
    async fn end_train(&self, _ctx: &TrainContext, _run: &RunRecord) -> Result<BTreeMap<String, Value>> {
        Ok(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant;

    #[async_trait]
    impl TrainingExecutor for Constant {
        async fn train(&self, _ctx: &TrainContext) -> Result<TrainOutput> {
            Ok(TrainOutput::new().with_artifact("pred", json!([])))
        }
    }

    #[tokio::test]
    async fn test_end_train_defaults_to_nothing() {
        let task = TaskDefinition::new(json!({"model": {"class": "LGBModel"}})).unwrap();
        let ctx = TrainContext {
            namespace: "exp".to_string(),
            task_id: task.fingerprint(),
            task: task.clone(),
            worker_id: WorkerId::from("w1"),
            attempt: 0,
        };
        let output = Constant.train(&ctx).await.unwrap();
        let run = RunRecord::new("exp", task, WorkerId::from("w1")).with_artifacts(output.artifacts);

        assert!(Constant.end_train(&ctx, &run).await.unwrap().is_empty());
        assert_eq!(run.artifact("pred"), Some(&json!([])));
    }
}
