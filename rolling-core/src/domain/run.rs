use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::document::TaskDefinition;
use super::ids::{RunId, TaskFingerprint, WorkerId};
use super::segment::Segment;

// ===== Run Status =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, RunStatus::Finished)
    }
}

// ===== Run Record =====

/// A training run as kept by the experiment store.
///
/// Carries the originating task definition for provenance, so collection can
/// group and filter on any part of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: RunId,
    pub namespace: String,
    pub task_id: TaskFingerprint,
    pub task: TaskDefinition,
    pub worker: WorkerId,
    pub status: RunStatus,
    pub artifacts: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(namespace: impl Into<String>, task: TaskDefinition, worker: WorkerId) -> Self {
        Self {
            id: RunId::new(),
            namespace: namespace.into(),
            task_id: task.fingerprint(),
            task,
            worker,
            status: RunStatus::Finished,
            artifacts: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: BTreeMap<String, Value>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn artifact(&self, name: &str) -> Option<&Value> {
        self.artifacts.get(name)
    }

    /// The test segment of the originating task, if it has a well-formed one.
    pub fn test_segment(&self) -> Option<Segment> {
        self.task.segment("test").ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_record_carries_task_identity() {
        let task = TaskDefinition::new(json!({
            "model": {"class": "XGBModel"},
            "dataset": {"kwargs": {"segments": {"test": ["2017-01-01", "2017-12-31"]}}}
        }))
        .unwrap();
        let run = RunRecord::new("rolling_exp", task.clone(), WorkerId::from("w1"))
            .with_artifacts(BTreeMap::from([("pred".to_string(), json!([]))]));

        assert_eq!(run.task_id, task.fingerprint());
        assert!(run.status.is_successful());
        assert_eq!(run.artifact("pred"), Some(&json!([])));
        assert_eq!(
            run.test_segment(),
            Some(Segment::parse("2017-01-01", "2017-12-31").unwrap())
        );
    }
}
