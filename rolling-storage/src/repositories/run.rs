use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rolling_core::domain::{RunId, RunRecord, RunStatus, TaskDefinition, TaskFingerprint, WorkerId};
use rolling_core::{CoreError, ExperimentStore, Result};
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, namespace, task_id, task, worker, status, artifacts, created_at";

/// Run records kept in the `rolling_runs` table.
pub struct RunRepository {
    pool: PgPool,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExperimentStore for RunRepository {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let task_text = serde_json::to_string(&run.task)?;

        sqlx::query(
            r#"
            INSERT INTO rolling_runs (id, namespace, task_id, task, worker, status, artifacts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id.0)
        .bind(&run.namespace)
        .bind(run.task_id.as_str())
        .bind(task_text)
        .bind(run.worker.as_str())
        .bind(run.status.as_str())
        .bind(Json(&run.artifacts))
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM rolling_runs WHERE id = $1", RUN_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_run).transpose()
    }

    async fn list_run_ids(&self, namespace: &str) -> Result<Vec<RunId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM rolling_runs WHERE namespace = $1 ORDER BY created_at, id",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(RunId).collect())
    }

    async fn find_by_task(&self, namespace: &str, task_id: &TaskFingerprint) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rolling_runs \
             WHERE namespace = $1 AND task_id = $2 AND status = 'finished' \
             ORDER BY created_at, id LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(namespace)
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_run).transpose()
    }

    async fn add_artifacts(&self, id: &RunId, artifacts: BTreeMap<String, Value>) -> Result<()> {
        // jsonb `||` keeps the right operand on key clashes, so existing keys win
        let result = sqlx::query("UPDATE rolling_runs SET artifacts = $2 || artifacts WHERE id = $1")
            .bind(id.0)
            .bind(Json(&artifacts))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Run {} not found", id)));
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rolling_runs WHERE namespace = $1")
            .bind(namespace)
            .execute(&self.pool)
            .await?;

        tracing::info!("Deleted {} run records from namespace {}", result.rows_affected(), namespace);
        Ok(result.rows_affected())
    }
}

fn str_to_run_status(s: &str) -> Result<RunStatus> {
    match s {
        "finished" => Ok(RunStatus::Finished),
        "failed" => Ok(RunStatus::Failed),
        other => Err(CoreError::Serialization(format!("unknown run status '{}'", other))),
    }
}

fn row_to_run(row: PgRow) -> Result<RunRecord> {
    let id: Uuid = row.try_get("id")?;
    let namespace: String = row.try_get("namespace")?;
    let task_id: String = row.try_get("task_id")?;
    let task_text: String = row.try_get("task")?;
    let worker: String = row.try_get("worker")?;
    let status: String = row.try_get("status")?;
    let Json(artifacts): Json<BTreeMap<String, Value>> = row.try_get("artifacts")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    let task: TaskDefinition = serde_json::from_str(&task_text)?;

    Ok(RunRecord {
        id: RunId(id),
        namespace,
        task_id: TaskFingerprint(task_id),
        task,
        worker: WorkerId(worker),
        status: str_to_run_status(&status)?,
        artifacts,
        created_at,
    })
}
