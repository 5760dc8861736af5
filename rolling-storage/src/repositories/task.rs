use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rolling_core::domain::{
    RunId, TaskDefinition, TaskFilter, TaskFingerprint, TaskRecord, TaskStatus, TaskUpdate, WorkerId,
};
use rolling_core::{CoreError, Result, TaskBackend};
use sqlx::{postgres::PgRow, types::Json, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, definition_text, status, owner, lease_expiry, result_ref, \
                            retry_count, last_error, created_at, updated_at";

/// Task pools kept in the `rolling_tasks` table.
///
/// Every state transition is one `UPDATE ... WHERE id = (SELECT ... FOR UPDATE)`
/// statement, so the filter check and the write cannot interleave with
/// another worker's.
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskBackend for TaskRepository {
    async fn insert_absent(&self, pool: &str, records: &[TaskRecord]) -> Result<Vec<TaskFingerprint>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for record in records {
            let definition_text = serde_json::to_string(&record.definition)?;
            let row = sqlx::query(
                r#"
                INSERT INTO rolling_tasks (
                    pool, id, definition, definition_text, status, retry_count,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (pool, id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(pool)
            .bind(record.id.as_str())
            .bind(Json(record.definition.as_value()))
            .bind(&definition_text)
            .bind(record.status.as_str())
            .bind(record.retry_count as i32)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| CoreError::Database(format!("inserting task {}: {}", record.id, e)))?;

            if row.is_some() {
                inserted.push(record.id.clone());
            }
        }

        tx.commit().await?;
        tracing::debug!("Inserted {} task records into pool {}", inserted.len(), pool);
        Ok(inserted)
    }

    async fn find_one_and_update(
        &self,
        pool: &str,
        filter: &TaskFilter,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE rolling_tasks SET ");
        push_update(&mut qb, update, now);
        qb.push(" WHERE pool = ").push_bind(pool.to_string());
        qb.push(" AND id = (SELECT id FROM rolling_tasks");
        push_filter(&mut qb, pool, filter);
        qb.push(" ORDER BY created_at, id LIMIT 1");
        // claimers skip rows another claimer holds; targeted updates wait for them
        if matches!(update, TaskUpdate::Claim { .. }) {
            qb.push(" FOR UPDATE SKIP LOCKED)");
        } else {
            qb.push(" FOR UPDATE)");
        }
        qb.push(" RETURNING ").push(TASK_COLUMNS);

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(row_to_task).transpose()
    }

    async fn find(&self, pool: &str, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        qb.push(TASK_COLUMNS).push(" FROM rolling_tasks");
        push_filter(&mut qb, pool, filter);
        qb.push(" ORDER BY created_at, id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn delete_many(&self, pool: &str, filter: &TaskFilter) -> Result<u64> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("DELETE FROM rolling_tasks");
        push_filter(&mut qb, pool, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, pool: &str, filter: &TaskFilter) {
    qb.push(" WHERE pool = ").push_bind(pool.to_string());

    if let Some(ids) = &filter.ids {
        let ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        qb.push(" AND id = ANY(").push_bind(ids).push(")");
    }
    if let Some(statuses) = &filter.statuses {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(owner) = &filter.owner {
        qb.push(" AND owner = ").push_bind(owner.0.clone());
    }
    if let Some(at) = filter.claimable_at {
        qb.push(" AND (status = 'waiting' OR (status = 'running' AND (lease_expiry IS NULL OR lease_expiry <= ")
            .push_bind(at)
            .push(")))");
    }
}

fn push_update(qb: &mut QueryBuilder<'_, Postgres>, update: &TaskUpdate, now: DateTime<Utc>) {
    match update {
        TaskUpdate::Claim { owner, lease_expiry } => {
            // right-hand side sees the pre-update status
            qb.push("retry_count = retry_count + CASE WHEN status = 'running' THEN 1 ELSE 0 END");
            qb.push(", status = 'running', result_ref = NULL, owner = ")
                .push_bind(owner.0.clone());
            qb.push(", lease_expiry = ").push_bind(*lease_expiry);
        }
        TaskUpdate::Heartbeat { lease_expiry } => {
            qb.push("lease_expiry = ").push_bind(*lease_expiry);
        }
        TaskUpdate::Complete { result_ref } => {
            qb.push("status = 'done', owner = NULL, lease_expiry = NULL, result_ref = ")
                .push_bind(result_ref.0);
        }
        TaskUpdate::CompletePartial { result_ref } => {
            qb.push("status = 'part_done', owner = NULL, lease_expiry = NULL, result_ref = ")
                .push_bind(result_ref.0);
        }
        TaskUpdate::Finalize => {
            qb.push("status = 'done'");
        }
        TaskUpdate::Requeue { error } => {
            qb.push("status = 'waiting', retry_count = retry_count + 1, owner = NULL, ");
            qb.push("lease_expiry = NULL, result_ref = NULL, last_error = ")
                .push_bind(error.clone());
        }
        TaskUpdate::Fail { error } => {
            qb.push("status = 'failed', owner = NULL, lease_expiry = NULL, result_ref = NULL, last_error = ")
                .push_bind(error.clone());
        }
        TaskUpdate::Reset => {
            qb.push("status = 'waiting', owner = NULL, lease_expiry = NULL, result_ref = NULL");
        }
    }
    qb.push(", updated_at = ").push_bind(now);
}

fn row_to_task(row: PgRow) -> Result<TaskRecord> {
    let id: String = row.try_get("id")?;
    let definition_text: String = row.try_get("definition_text")?;
    let status: String = row.try_get("status")?;
    let owner: Option<String> = row.try_get("owner")?;
    let lease_expiry: Option<DateTime<Utc>> = row.try_get("lease_expiry")?;
    let result_ref: Option<Uuid> = row.try_get("result_ref")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    let definition: TaskDefinition = serde_json::from_str(&definition_text)?;

    Ok(TaskRecord {
        id: TaskFingerprint(id),
        definition,
        status: TaskStatus::parse(&status)?,
        owner: owner.map(WorkerId),
        lease_expiry,
        result_ref: result_ref.map(RunId),
        retry_count: retry_count.max(0) as u32,
        last_error,
        created_at,
        updated_at,
    })
}
