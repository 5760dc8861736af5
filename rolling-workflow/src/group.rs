//! Reducers turning one bucket of run records into an aggregate.
//!
//! Buckets arrive sorted by test segment start, so reducers may rely on
//! record order being the rolling order.

use rolling_core::domain::{RunRecord, TaskFingerprint};
use rolling_core::{CoreError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::collect::GroupKey;

pub trait GroupReducer: Send + Sync {
    type Output;

    fn reduce(&self, key: &GroupKey, records: &[RunRecord]) -> Result<Self::Output>;
}

impl<F, A> GroupReducer for F
where
    F: Fn(&GroupKey, &[RunRecord]) -> Result<A> + Send + Sync,
{
    type Output = A;

    fn reduce(&self, key: &GroupKey, records: &[RunRecord]) -> Result<A> {
        self(key, records)
    }
}

/// Stitch the per-segment prediction series of a bucket into one series.
///
/// `artifact` must be an array of objects that each carry `index_field`.
/// Rows are ordered by index; when consecutive segments overlap, the row from
/// the later segment wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingGroup {
    pub artifact: String,
    pub index_field: String,
}

impl RollingGroup {
    pub fn new(artifact: impl Into<String>, index_field: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            index_field: index_field.into(),
        }
    }
}

impl Default for RollingGroup {
    fn default() -> Self {
        Self::new("pred", "datetime")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum IndexValue {
    Int(i64),
    Text(String),
}

impl GroupReducer for RollingGroup {
    type Output = Value;

    fn reduce(&self, _key: &GroupKey, records: &[RunRecord]) -> Result<Value> {
        let mut rows: BTreeMap<IndexValue, Value> = BTreeMap::new();

        for record in records {
            let series = record
                .artifact(&self.artifact)
                .and_then(Value::as_array)
                .ok_or_else(|| CoreError::record(record.id, format!("artifact '{}' is not a series", self.artifact)))?;

            for row in series {
                let index = match row.get(&self.index_field) {
                    Some(Value::String(s)) => IndexValue::Text(s.clone()),
                    Some(Value::Number(n)) if n.is_i64() => IndexValue::Int(n.as_i64().unwrap_or_default()),
                    _ => {
                        return Err(CoreError::record(
                            record.id,
                            format!("row in '{}' has no usable '{}'", self.artifact, self.index_field),
                        ))
                    }
                };
                rows.insert(index, row.clone());
            }
        }

        Ok(Value::Array(rows.into_values().collect()))
    }
}

/// The named artifact of every run in the bucket, by task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectArtifacts {
    pub artifact: String,
}

impl CollectArtifacts {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self { artifact: artifact.into() }
    }
}

impl GroupReducer for CollectArtifacts {
    type Output = BTreeMap<TaskFingerprint, Value>;

    fn reduce(&self, _key: &GroupKey, records: &[RunRecord]) -> Result<Self::Output> {
        records
            .iter()
            .map(|record| {
                record
                    .artifact(&self.artifact)
                    .cloned()
                    .map(|value| (record.task_id.clone(), value))
                    .ok_or_else(|| CoreError::record(record.id, format!("missing artifact '{}'", self.artifact)))
            })
            .collect()
    }
}

/// Number of runs in the bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountRecords;

impl GroupReducer for CountRecords {
    type Output = usize;

    fn reduce(&self, _key: &GroupKey, records: &[RunRecord]) -> Result<usize> {
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rolling_core::domain::{TaskDefinition, WorkerId};
    use serde_json::json;

    fn run(seed: u32, pred: Value) -> RunRecord {
        let task = TaskDefinition::new(json!({"model": {"class": "LGBModel"}, "seed": seed})).unwrap();
        RunRecord::new("exp", task, WorkerId::from("w1"))
            .with_artifacts(BTreeMap::from([("pred".to_string(), pred)]))
    }

    fn key() -> GroupKey {
        GroupKey::new(["LGBModel"])
    }

    #[test]
    fn test_rolling_group_later_segment_wins() {
        let records = vec![
            run(1, json!([
                {"datetime": "2017-01-02", "score": 0.1},
                {"datetime": "2017-01-03", "score": 0.2}
            ])),
            run(2, json!([
                {"datetime": "2017-01-03", "score": 0.9},
                {"datetime": "2017-01-04", "score": 0.3}
            ])),
        ];

        let merged = RollingGroup::default().reduce(&key(), &records).unwrap();
        assert_eq!(
            merged,
            json!([
                {"datetime": "2017-01-02", "score": 0.1},
                {"datetime": "2017-01-03", "score": 0.9},
                {"datetime": "2017-01-04", "score": 0.3}
            ])
        );
    }

    #[test]
    fn test_rolling_group_rejects_malformed_series() {
        let records = vec![run(1, json!({"not": "a series"}))];
        let err = RollingGroup::default().reduce(&key(), &records).unwrap_err();
        assert!(matches!(err, CoreError::CollectionRecord { .. }));

        let records = vec![run(1, json!([{"score": 0.1}]))];
        assert!(RollingGroup::default().reduce(&key(), &records).is_err());
    }

    #[test]
    fn test_collect_artifacts_and_count() {
        let records = vec![run(1, json!([1])), run(2, json!([2]))];
        let artifacts = CollectArtifacts::new("pred").reduce(&key(), &records).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[&records[0].task_id], json!([1]));
        assert_eq!(CountRecords.reduce(&key(), &records).unwrap(), 2);

        assert!(CollectArtifacts::new("ic").reduce(&key(), &records).is_err());
    }

    #[test]
    fn test_closures_are_reducers() {
        let first_seed = |_key: &GroupKey, records: &[RunRecord]| -> Result<Option<Value>> {
            Ok(records.first().and_then(|r| r.task.lookup("seed").cloned()))
        };
        let records = vec![run(7, json!([]))];
        assert_eq!(first_seed.reduce(&key(), &records).unwrap(), Some(json!(7)));
    }
}
