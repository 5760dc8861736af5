use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::document::TaskDefinition;
use super::ids::{RunId, TaskFingerprint, WorkerId};
use crate::error::{CoreError, Result};

// ===== Task Status =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Done,
    Failed,
    /// Produced a result but still needs a downstream finishing step.
    #[serde(rename = "part_done")]
    PartialDone,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Waiting,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::PartialDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::PartialDone => "part_done",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "part_done" => Ok(TaskStatus::PartialDone),
            other => Err(CoreError::Serialization(format!("unknown task status '{}'", other))),
        }
    }

    /// No worker will pick the task up again without an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::PartialDone
        )
    }

    /// Terminal states that carry a result reference.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::PartialDone)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===== Task Record =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskFingerprint,
    pub definition: TaskDefinition,
    pub status: TaskStatus,
    pub owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub result_ref: Option<RunId>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh WAITING record keyed by the definition's fingerprint.
    pub fn new(definition: TaskDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: definition.fingerprint(),
            definition,
            status: TaskStatus::Waiting,
            owner: None,
            lease_expiry: None,
            result_ref: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker_id)
    }

    /// WAITING, or RUNNING with a lease that has run out at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Waiting => true,
            TaskStatus::Running => self.lease_expiry.map_or(true, |expiry| expiry <= now),
            _ => false,
        }
    }
}

// ===== Filter =====

/// Conjunction of optional clauses selecting task records in one pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub ids: Option<Vec<TaskFingerprint>>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub owner: Option<WorkerId>,
    pub claimable_at: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(id: &TaskFingerprint) -> Self {
        Self {
            ids: Some(vec![id.clone()]),
            ..Self::default()
        }
    }

    pub fn ids(ids: Vec<TaskFingerprint>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Self::default()
        }
    }

    pub fn claimable(now: DateTime<Utc>) -> Self {
        Self {
            claimable_at: Some(now),
            ..Self::default()
        }
    }

    /// Records a given worker currently holds.
    pub fn owned(id: &TaskFingerprint, worker_id: &WorkerId) -> Self {
        Self {
            ids: Some(vec![id.clone()]),
            statuses: Some(vec![TaskStatus::Running]),
            owner: Some(worker_id.clone()),
            claimable_at: None,
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn with_ids(mut self, ids: Vec<TaskFingerprint>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if !record.is_owned_by(owner) {
                return false;
            }
        }
        if let Some(now) = self.claimable_at {
            if !record.is_claimable(now) {
                return false;
            }
        }
        true
    }
}

// ===== Update =====

/// A state transition, applied by the backend in the same atomic step that
/// evaluated the filter.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Claim {
        owner: WorkerId,
        lease_expiry: DateTime<Utc>,
    },
    Heartbeat {
        lease_expiry: DateTime<Utc>,
    },
    Complete {
        result_ref: RunId,
    },
    CompletePartial {
        result_ref: RunId,
    },
    Finalize,
    Requeue {
        error: Option<String>,
    },
    Fail {
        error: Option<String>,
    },
    Reset,
}

impl TaskUpdate {
    pub fn apply(&self, record: &mut TaskRecord, now: DateTime<Utc>) {
        match self {
            TaskUpdate::Claim { owner, lease_expiry } => {
                // taking over an expired lease counts as a retry
                if record.status == TaskStatus::Running {
                    record.retry_count += 1;
                }
                record.status = TaskStatus::Running;
                record.owner = Some(owner.clone());
                record.lease_expiry = Some(*lease_expiry);
                record.result_ref = None;
            }
            TaskUpdate::Heartbeat { lease_expiry } => {
                record.lease_expiry = Some(*lease_expiry);
            }
            TaskUpdate::Complete { result_ref } => {
                record.status = TaskStatus::Done;
                record.result_ref = Some(*result_ref);
                record.owner = None;
                record.lease_expiry = None;
            }
            TaskUpdate::CompletePartial { result_ref } => {
                record.status = TaskStatus::PartialDone;
                record.result_ref = Some(*result_ref);
                record.owner = None;
                record.lease_expiry = None;
            }
            TaskUpdate::Finalize => {
                record.status = TaskStatus::Done;
            }
            TaskUpdate::Requeue { error } => {
                record.status = TaskStatus::Waiting;
                record.retry_count += 1;
                record.owner = None;
                record.lease_expiry = None;
                record.result_ref = None;
                record.last_error = error.clone();
            }
            TaskUpdate::Fail { error } => {
                record.status = TaskStatus::Failed;
                record.owner = None;
                record.lease_expiry = None;
                record.result_ref = None;
                record.last_error = error.clone();
            }
            TaskUpdate::Reset => {
                record.status = TaskStatus::Waiting;
                record.owner = None;
                record.lease_expiry = None;
                record.result_ref = None;
            }
        }
        record.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskRecord::new(TaskDefinition::new(json!({"model": {"class": "LGBModel"}})).unwrap())
    }

    #[rstest]
    #[case(TaskStatus::Waiting, "waiting")]
    #[case(TaskStatus::Running, "running")]
    #[case(TaskStatus::Done, "done")]
    #[case(TaskStatus::Failed, "failed")]
    #[case(TaskStatus::PartialDone, "part_done")]
    fn test_status_text(#[case] status: TaskStatus, #[case] text: &str) {
        assert_eq!(status.as_str(), text);
        assert_eq!(TaskStatus::parse(text).unwrap(), status);
        assert_eq!(serde_json::to_value(status).unwrap(), json!(text));
    }

    #[test]
    fn test_claimability() {
        let now = Utc::now();
        let mut task = record();
        assert!(task.is_claimable(now));

        TaskUpdate::Claim {
            owner: WorkerId::from("w1"),
            lease_expiry: now + Duration::seconds(30),
        }
        .apply(&mut task, now);
        assert!(!task.is_claimable(now));
        assert!(task.is_claimable(now + Duration::seconds(31)));

        TaskUpdate::Complete { result_ref: RunId::new() }.apply(&mut task, now);
        assert!(!task.is_claimable(now + Duration::days(1)));
    }

    #[test]
    fn test_reclaim_counts_as_retry() {
        let now = Utc::now();
        let mut task = record();
        let claim = |owner: &str| TaskUpdate::Claim {
            owner: WorkerId::from(owner),
            lease_expiry: now,
        };

        claim("w1").apply(&mut task, now);
        assert_eq!(task.retry_count, 0);
        claim("w2").apply(&mut task, now);
        assert_eq!(task.retry_count, 1);
        assert!(task.is_owned_by(&WorkerId::from("w2")));
    }

    #[test]
    fn test_result_ref_only_on_success() {
        let now = Utc::now();
        let mut task = record();
        let run = RunId::new();

        TaskUpdate::CompletePartial { result_ref: run }.apply(&mut task, now);
        assert_eq!(task.status, TaskStatus::PartialDone);
        assert_eq!(task.result_ref, Some(run));
        assert!(task.owner.is_none());

        TaskUpdate::Finalize.apply(&mut task, now);
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result_ref, Some(run));

        TaskUpdate::Reset.apply(&mut task, now);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert!(task.result_ref.is_none());

        TaskUpdate::Fail { error: Some("boom".to_string()) }.apply(&mut task, now);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result_ref.is_none());
        assert_eq!(task.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let mut task = record();
        let worker = WorkerId::from("w1");

        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::id(&task.id).matches(&task));
        assert!(!TaskFilter::id(&TaskFingerprint::from("other")).matches(&task));
        assert!(!TaskFilter::owned(&task.id, &worker).matches(&task));

        TaskUpdate::Claim {
            owner: worker.clone(),
            lease_expiry: now + Duration::seconds(10),
        }
        .apply(&mut task, now);

        assert!(TaskFilter::owned(&task.id, &worker).matches(&task));
        assert!(!TaskFilter::owned(&task.id, &WorkerId::from("w2")).matches(&task));
        assert!(!TaskFilter::claimable(now).matches(&task));
        assert!(TaskFilter::status(TaskStatus::Running).matches(&task));
    }
}
