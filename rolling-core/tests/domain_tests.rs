use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rolling_core::domain::*;
use rolling_core::CoreError;
use rstest::rstest;
use serde_json::{json, Map, Value};

fn rolling_task() -> TaskDefinition {
    TaskDefinition::new(json!({
        "model": {"class": "LGBModel", "module_path": "qlib.contrib.model.gbdt"},
        "dataset": {
            "class": "DatasetH",
            "kwargs": {
                "handler": {"class": "Alpha158", "kwargs": {"end_time": "2020-08-01"}},
                "segments": {
                    "train": ["2008-01-01", "2014-12-31"],
                    "valid": ["2015-01-01", "2016-12-31"],
                    "test": ["2017-01-01", "2020-08-01"]
                }
            }
        },
        "record": [{"class": "SignalRecord"}]
    }))
    .unwrap()
}

// ===== TaskDefinition Tests =====

#[test]
fn test_definition_serialization_roundtrip() {
    let original = rolling_task();
    let text = serde_json::to_string(&original).unwrap();
    let back: TaskDefinition = serde_json::from_str(&text).unwrap();

    assert_eq!(back, original);
    assert_eq!(serde_json::to_string(&back).unwrap(), text);
    assert_eq!(back.fingerprint(), original.fingerprint());
}

#[test]
fn test_definition_paths() {
    let task = rolling_task();
    assert_eq!(task.model_class(), Some("LGBModel"));
    assert_eq!(task.lookup_str("record.0.class"), Some("SignalRecord"));
    assert_eq!(task.lookup("record.1"), None);
    assert_eq!(task.segment_names(), vec!["train", "valid", "test"]);
    assert_eq!(
        task.segment("valid").unwrap(),
        Some(Segment::parse("2015-01-01", "2016-12-31").unwrap())
    );
}

#[test]
fn test_changed_segment_changes_fingerprint() {
    let task = rolling_task();
    let mut rolled = task.clone();
    rolled
        .set_segment("test", Segment::parse("2017-01-01", "2017-06-30").unwrap())
        .unwrap();
    assert_ne!(rolled.fingerprint(), task.fingerprint());
}

#[test]
fn test_non_object_definition_is_rejected() {
    let err = serde_json::from_value::<TaskDefinition>(json!(["not", "a", "task"]));
    assert!(err.is_err());
    assert!(matches!(TaskDefinition::new(json!(1)), Err(CoreError::Validation(_))));
}

// ===== TaskRecord Tests =====

#[rstest]
#[case(TaskStatus::Waiting, None, true)]
#[case(TaskStatus::Running, Some(-5), true)]
#[case(TaskStatus::Running, Some(30), false)]
#[case(TaskStatus::Done, None, false)]
#[case(TaskStatus::Failed, None, false)]
#[case(TaskStatus::PartialDone, None, false)]
fn test_claimability(#[case] status: TaskStatus, #[case] lease_secs: Option<i64>, #[case] expected: bool) {
    let now = Utc::now();
    let mut record = TaskRecord::new(rolling_task());
    record.status = status;
    record.lease_expiry = lease_secs.map(|s| now + Duration::seconds(s));

    assert_eq!(record.is_claimable(now), expected);
    assert_eq!(TaskFilter::claimable(now).matches(&record), expected);
}

#[test]
fn test_status_strings_round_trip() {
    for status in TaskStatus::ALL {
        assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        let encoded = serde_json::to_value(status).unwrap();
        assert_eq!(encoded, json!(status.as_str()));
    }
    assert_eq!(TaskStatus::PartialDone.as_str(), "part_done");
    assert!(TaskStatus::parse("finished").is_err());
}

#[test]
fn test_lifecycle_keeps_result_ref_with_success() {
    let now = Utc::now();
    let worker = WorkerId::from("w1");
    let mut record = TaskRecord::new(rolling_task());

    TaskUpdate::Claim {
        owner: worker.clone(),
        lease_expiry: now + Duration::seconds(60),
    }
    .apply(&mut record, now);
    assert!(record.is_owned_by(&worker));
    assert_eq!(record.result_ref, None);

    let run = RunId::new();
    TaskUpdate::CompletePartial { result_ref: run }.apply(&mut record, now);
    assert!(record.status.is_success());
    assert_eq!(record.result_ref, Some(run));

    TaskUpdate::Finalize.apply(&mut record, now);
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.result_ref, Some(run));

    TaskUpdate::Reset.apply(&mut record, now);
    assert_eq!(record.status, TaskStatus::Waiting);
    assert_eq!(record.result_ref, None);
}

// ===== RunRecord Tests =====

#[test]
fn test_run_record_serialization_roundtrip() {
    let run = RunRecord::new("rolling_exp", rolling_task(), WorkerId::from("w1"))
        .with_artifacts([("ic".to_string(), json!(0.051))].into_iter().collect());
    let back: RunRecord = serde_json::from_str(&serde_json::to_string(&run).unwrap()).unwrap();

    assert_eq!(back, run);
    assert_eq!(back.test_segment(), Some(Segment::parse("2017-01-01", "2020-08-01").unwrap()));
}

// ===== Property-based Tests =====

fn shuffled_object(entries: Vec<(String, i64)>, reverse: bool) -> Value {
    let mut entries = entries;
    if reverse {
        entries.reverse();
    }
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key, json!(value));
    }
    json!({"model": {"kwargs": Value::Object(map)}})
}

proptest! {
    #[test]
    fn test_fingerprint_independent_of_key_order(
        entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
    ) {
        let entries: Vec<(String, i64)> = entries.into_iter().collect();
        let forward = TaskDefinition::new(shuffled_object(entries.clone(), false)).unwrap();
        let backward = TaskDefinition::new(shuffled_object(entries, true)).unwrap();
        prop_assert_eq!(forward.fingerprint(), backward.fingerprint());
    }

    #[test]
    fn test_segment_shift_preserves_length(start in 0u64..20_000, len in 0u64..2_000, days in 0u64..5_000) {
        let origin = chrono::NaiveDate::from_ymd_opt(1990, 1, 1).unwrap();
        let start = origin.checked_add_days(chrono::Days::new(start)).unwrap();
        let end = start.checked_add_days(chrono::Days::new(len)).unwrap();
        let segment = Segment::new(start, end).unwrap();

        prop_assert_eq!(segment.shift(days).unwrap().len_days(), segment.len_days());
        prop_assert_eq!(segment.extend(days).unwrap().len_days(), segment.len_days() + days);
        prop_assert!(segment.truncate(days).len_days() >= 1);
    }
}
