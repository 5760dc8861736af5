use async_trait::async_trait;
use rolling_core::domain::{RunId, RunRecord, TaskFingerprint};
use rolling_core::{CoreError, ExperimentStore, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Run records held in memory, in creation order.
#[derive(Debug, Default)]
pub struct InMemoryExperimentStore {
    runs: RwLock<Vec<RunRecord>>,
}

fn poison_err<T>(_: PoisonError<T>) -> CoreError {
    CoreError::Internal("run store lock poisoned".to_string())
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs across every namespace.
    pub fn len(&self) -> usize {
        self.runs.read().map(|runs| runs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExperimentStore for InMemoryExperimentStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        if runs.iter().any(|r| r.id == run.id) {
            return Err(CoreError::InvalidState(format!("Run {} already exists", run.id)));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs.iter().find(|r| &r.id == id).cloned())
    }

    async fn list_run_ids(&self, namespace: &str) -> Result<Vec<RunId>> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs
            .iter()
            .filter(|r| r.namespace == namespace)
            .map(|r| r.id)
            .collect())
    }

    async fn find_by_task(&self, namespace: &str, task_id: &TaskFingerprint) -> Result<Option<RunRecord>> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs
            .iter()
            .find(|r| r.namespace == namespace && &r.task_id == task_id && r.status.is_successful())
            .cloned())
    }

    async fn add_artifacts(&self, id: &RunId, artifacts: BTreeMap<String, Value>) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let run = runs
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("Run {} not found", id)))?;

        for (name, value) in artifacts {
            run.artifacts.entry(name).or_insert(value);
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let before = runs.len();
        runs.retain(|r| r.namespace != namespace);
        Ok((before - runs.len()) as u64)
    }
}
