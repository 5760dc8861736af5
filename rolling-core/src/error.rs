use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Lost a race for a task. Absorbed by the queue, which simply claims again.
    #[error("Claim conflict: {0}")]
    ClaimConflict(String),

    /// The caller tried to mutate a task it no longer owns.
    #[error("Task {task_id} is not owned by worker {worker_id}")]
    Ownership { task_id: String, worker_id: String },

    #[error("Training execution error: {0}")]
    TrainingExecution(String),

    #[error("Run record {run_id}: {reason}")]
    CollectionRecord { run_id: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn ownership(task_id: impl ToString, worker_id: impl ToString) -> Self {
        CoreError::Ownership {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn record(run_id: impl ToString, reason: impl Into<String>) -> Self {
        CoreError::CollectionRecord {
            run_id: run_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error is a transient race that the queue retries on its own.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::ClaimConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(feature = "database")]
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        // 40001 serialization_failure, 40P01 deadlock_detected, 55P03 lock_not_available
        if let sqlx::Error::Database(db) = &err {
            if matches!(db.code().as_deref(), Some("40001" | "40P01" | "55P03")) {
                return CoreError::ClaimConflict(db.message().to_string());
            }
        }
        CoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
