//! Collection passes over the run records of one experiment namespace.

use rolling_core::domain::{RunId, RunRecord, MODEL_CLASS_PATH, SEGMENTS_PATH};
use rolling_core::{CoreError, ExperimentStore, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::group::GroupReducer;
use crate::metrics;

// ===== Group Key =====

/// Bucket label derived from a run's task definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<String>);

impl GroupKey {
    pub fn new<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Build a key from document values: scalars without quotes, date pairs as
    /// `start..end`, anything else as compact JSON.
    pub fn from_values(values: &[&Value]) -> Self {
        Self(values.iter().map(|v| render(v)).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(items) => match items.as_slice() {
            [Value::String(start), Value::String(end)] => format!("{}..{}", start, end),
            _ => value.to_string(),
        },
        Value::Object(_) => value.to_string(),
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

// ===== Key and filter helpers =====

/// Model class crossed with the test segment.
pub fn model_and_test_key(record: &RunRecord) -> Result<GroupKey> {
    let class = record
        .task
        .lookup(MODEL_CLASS_PATH)
        .ok_or_else(|| CoreError::record(record.id, "task has no model class"))?;
    let test_path = format!("{}.test", SEGMENTS_PATH);
    let test = record
        .task
        .lookup(&test_path)
        .ok_or_else(|| CoreError::record(record.id, "task has no test segment"))?;
    Ok(GroupKey::from_values(&[class, test]))
}

/// Model class alone, for reducers that merge every segment of one model.
pub fn model_key(record: &RunRecord) -> Result<GroupKey> {
    let class = record
        .task
        .lookup(MODEL_CLASS_PATH)
        .ok_or_else(|| CoreError::record(record.id, "task has no model class"))?;
    Ok(GroupKey::from_values(&[class]))
}

/// Keep only runs of one model class.
pub fn model_class_is(name: impl Into<String>) -> impl Fn(&RunRecord) -> Result<bool> + Send + Sync {
    let name = name.into();
    move |record| Ok(record.task.model_class() == Some(name.as_str()))
}

// ===== Report =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionWarning {
    pub run_id: Option<RunId>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectReport {
    pub scanned: usize,
    pub filtered_out: usize,
    pub skipped: usize,
    pub aggregated: usize,
    pub groups: usize,
    pub warnings: Vec<CollectionWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collection<A> {
    pub groups: BTreeMap<GroupKey, A>,
    pub report: CollectReport,
}

// ===== Collector =====

pub struct RunCollector {
    store: Arc<dyn ExperimentStore>,
    namespace: String,
    strict: bool,
}

impl RunCollector {
    pub fn new(store: Arc<dyn ExperimentStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            strict: false,
        }
    }

    /// In strict mode a malformed record aborts the pass instead of being
    /// skipped with a warning.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub async fn collect<K, F, R>(&self, key_fn: K, filter_fn: F, reducer: &R) -> Result<Collection<R::Output>>
    where
        K: Fn(&RunRecord) -> Result<GroupKey>,
        F: Fn(&RunRecord) -> Result<bool>,
        R: GroupReducer + ?Sized,
    {
        let mut report = CollectReport::default();
        let mut buckets: BTreeMap<GroupKey, Vec<RunRecord>> = BTreeMap::new();

        for run_id in self.store.list_run_ids(&self.namespace).await? {
            report.scanned += 1;

            let record = match self.store.get_run(&run_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.skip(&mut report, run_id, CoreError::record(run_id, "run disappeared during collection"))?;
                    continue;
                }
                Err(CoreError::Database(message)) => return Err(CoreError::Database(message)),
                Err(e) => {
                    self.skip(&mut report, run_id, CoreError::record(run_id, e.to_string()))?;
                    continue;
                }
            };

            if !record.status.is_successful() {
                report.filtered_out += 1;
                continue;
            }

            match filter_fn(&record) {
                Ok(true) => {}
                Ok(false) => {
                    report.filtered_out += 1;
                    continue;
                }
                Err(e) => {
                    self.skip(&mut report, run_id, as_record_error(run_id, e))?;
                    continue;
                }
            }

            match key_fn(&record) {
                Ok(key) => buckets.entry(key).or_default().push(record),
                Err(e) => self.skip(&mut report, run_id, as_record_error(run_id, e))?,
            }
        }

        let mut groups = BTreeMap::new();
        for (key, mut records) in buckets {
            records.sort_by(|a, b| {
                (a.test_segment().map(|s| s.start), &a.task_id, a.id)
                    .cmp(&(b.test_segment().map(|s| s.start), &b.task_id, b.id))
            });

            if let Some(aggregate) = self.reduce_bucket(&mut report, &key, records, reducer)? {
                groups.insert(key, aggregate);
            }
        }
        report.groups = groups.len();

        metrics::collect_records(&self.namespace, "scanned", report.scanned);
        metrics::collect_records(&self.namespace, "filtered_out", report.filtered_out);
        metrics::collect_records(&self.namespace, "skipped", report.skipped);
        metrics::collect_records(&self.namespace, "aggregated", report.aggregated);
        tracing::info!(
            "Collected namespace {}: {} scanned, {} filtered out, {} skipped, {} aggregated into {} groups",
            self.namespace,
            report.scanned,
            report.filtered_out,
            report.skipped,
            report.aggregated,
            report.groups
        );

        Ok(Collection { groups, report })
    }

    /// Reduce one sorted bucket. A reducer error naming a run drops only that
    /// run and the rest of the bucket is reduced again.
    fn reduce_bucket<R>(
        &self,
        report: &mut CollectReport,
        key: &GroupKey,
        mut records: Vec<RunRecord>,
        reducer: &R,
    ) -> Result<Option<R::Output>>
    where
        R: GroupReducer + ?Sized,
    {
        while !records.is_empty() {
            let error = match reducer.reduce(key, &records) {
                Ok(aggregate) => {
                    report.aggregated += records.len();
                    return Ok(Some(aggregate));
                }
                Err(e) if self.strict => return Err(e),
                Err(e) => e,
            };

            let culprit = match &error {
                CoreError::CollectionRecord { run_id, .. } => {
                    records.iter().position(|r| r.id.to_string() == *run_id)
                }
                _ => None,
            };
            match culprit {
                Some(index) => {
                    let record = records.remove(index);
                    self.skip(report, record.id, error)?;
                }
                None => {
                    tracing::warn!("Skipping group {}: {}", key, error);
                    report.skipped += records.len();
                    report.warnings.push(CollectionWarning {
                        run_id: None,
                        message: format!("group {}: {}", key, error),
                    });
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn skip(&self, report: &mut CollectReport, run_id: RunId, error: CoreError) -> Result<()> {
        if self.strict {
            return Err(error);
        }
        tracing::warn!("Skipping run record: {}", error);
        report.skipped += 1;
        report.warnings.push(CollectionWarning {
            run_id: Some(run_id),
            message: error.to_string(),
        });
        Ok(())
    }
}

fn as_record_error(run_id: RunId, error: CoreError) -> CoreError {
    match error {
        CoreError::CollectionRecord { .. } => error,
        other => CoreError::record(run_id, other.to_string()),
    }
}
