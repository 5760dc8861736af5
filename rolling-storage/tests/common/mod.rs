//! Contract checks shared by every `TaskBackend` / `ExperimentStore`
//! implementation.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use rolling_core::domain::{
    RunRecord, TaskDefinition, TaskFilter, TaskRecord, TaskStatus, TaskUpdate, WorkerId,
};
use rolling_core::{ExperimentStore, TaskBackend};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Generate a unique pool or namespace name to avoid conflicts
pub fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn task(n: u32) -> TaskRecord {
    TaskRecord::new(
        TaskDefinition::new(json!({
            "model": {"class": "LGBModel", "kwargs": {"seed": n}},
            "dataset": {"kwargs": {"segments": {
                "train": ["2008-01-01", "2014-12-31"],
                "test": ["2017-01-01", "2017-06-30"]
            }}}
        }))
        .unwrap(),
    )
}

pub async fn insert_is_idempotent(backend: &dyn TaskBackend, pool: &str) {
    let inserted = backend.insert_absent(pool, &[task(1), task(2)]).await.unwrap();
    assert_eq!(inserted.len(), 2);

    let again = backend.insert_absent(pool, &[task(1), task(2)]).await.unwrap();
    assert!(again.is_empty());

    let all = backend.find(pool, &TaskFilter::all()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|t| t.status == TaskStatus::Waiting));
}

pub async fn definitions_round_trip(backend: &dyn TaskBackend, pool: &str) {
    let original = task(7);
    backend.insert_absent(pool, &[original.clone()]).await.unwrap();

    let stored = backend.find(pool, &TaskFilter::id(&original.id)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        serde_json::to_string(&stored[0].definition).unwrap(),
        serde_json::to_string(&original.definition).unwrap()
    );
    assert_eq!(stored[0].definition.fingerprint(), original.id);
}

/// Many concurrent claimers against fewer records: each record goes to
/// exactly one claimer.
pub async fn claims_are_exclusive(backend: Arc<dyn TaskBackend>, pool: &str) {
    let records: Vec<TaskRecord> = (0..4).map(task).collect();
    backend.insert_absent(pool, &records).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..12 {
        let backend = Arc::clone(&backend);
        let pool = pool.to_string();
        handles.push(tokio::spawn(async move {
            let now = Utc::now();
            let update = TaskUpdate::Claim {
                owner: WorkerId::new(format!("worker-{}", i)),
                lease_expiry: now + Duration::seconds(60),
            };
            backend
                .find_one_and_update(&pool, &TaskFilter::claimable(now), &update, now)
                .await
                .unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(record) = handle.await.unwrap() {
            claimed.push(record.id);
        }
    }

    let distinct: HashSet<_> = claimed.iter().cloned().collect();
    assert_eq!(claimed.len(), 4);
    assert_eq!(distinct.len(), 4);
}

pub async fn expired_lease_is_reclaimable(backend: &dyn TaskBackend, pool: &str) {
    backend.insert_absent(pool, &[task(1)]).await.unwrap();
    let now = Utc::now();

    let first = TaskUpdate::Claim {
        owner: WorkerId::from("w1"),
        lease_expiry: now + Duration::seconds(10),
    };
    let claimed = backend
        .find_one_and_update(pool, &TaskFilter::claimable(now), &first, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.retry_count, 0);

    // still leased
    let second = TaskUpdate::Claim {
        owner: WorkerId::from("w2"),
        lease_expiry: now + Duration::seconds(20),
    };
    let blocked = backend
        .find_one_and_update(pool, &TaskFilter::claimable(now), &second, now)
        .await
        .unwrap();
    assert!(blocked.is_none());

    let later = now + Duration::seconds(11);
    let reclaimed = backend
        .find_one_and_update(pool, &TaskFilter::claimable(later), &second, later)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, claimed.id);
    assert_eq!(reclaimed.owner, Some(WorkerId::from("w2")));
    assert_eq!(reclaimed.retry_count, 1);
}

pub async fn runs_round_trip(store: &dyn ExperimentStore, namespace: &str) {
    let definition = task(3).definition;
    let run = RunRecord::new(namespace, definition.clone(), WorkerId::from("w1"))
        .with_artifacts(BTreeMap::from([("pred".to_string(), json!([{"datetime": "2017-01-03", "score": 0.1}]))]));
    store.create_run(&run).await.unwrap();

    let ids = store.list_run_ids(namespace).await.unwrap();
    assert_eq!(ids, vec![run.id]);

    let loaded = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(loaded.task_id, definition.fingerprint());
    assert_eq!(
        serde_json::to_string(&loaded.task).unwrap(),
        serde_json::to_string(&definition).unwrap()
    );

    let found = store.find_by_task(namespace, &definition.fingerprint()).await.unwrap();
    assert_eq!(found.map(|r| r.id), Some(run.id));

    assert_eq!(store.delete_namespace(namespace).await.unwrap(), 1);
    assert!(store.get_run(&run.id).await.unwrap().is_none());
}
