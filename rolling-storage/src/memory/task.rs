use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rolling_core::domain::{TaskFilter, TaskFingerprint, TaskRecord, TaskUpdate};
use rolling_core::{CoreError, Result, TaskBackend};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Task pools held in memory.
///
/// A single write lock covers each find-and-update, so the filter check and
/// the transition happen as one step exactly as with the database backend.
/// Records keep insertion order within a pool.
#[derive(Debug, Default)]
pub struct InMemoryTaskBackend {
    pools: RwLock<HashMap<String, Vec<TaskRecord>>>,
}

fn poison_err<T>(_: PoisonError<T>) -> CoreError {
    CoreError::Internal("task store lock poisoned".to_string())
}

impl InMemoryTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskBackend for InMemoryTaskBackend {
    async fn insert_absent(&self, pool: &str, records: &[TaskRecord]) -> Result<Vec<TaskFingerprint>> {
        let mut pools = self.pools.write().map_err(poison_err)?;
        let tasks = pools.entry(pool.to_string()).or_default();

        let mut seen: HashSet<TaskFingerprint> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut inserted = Vec::new();
        for record in records {
            if seen.insert(record.id.clone()) {
                tasks.push(record.clone());
                inserted.push(record.id.clone());
            }
        }
        Ok(inserted)
    }

    async fn find_one_and_update(
        &self,
        pool: &str,
        filter: &TaskFilter,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let mut pools = self.pools.write().map_err(poison_err)?;
        let Some(tasks) = pools.get_mut(pool) else {
            return Ok(None);
        };

        Ok(tasks.iter_mut().find(|t| filter.matches(t)).map(|task| {
            update.apply(task, now);
            task.clone()
        }))
    }

    async fn find(&self, pool: &str, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let pools = self.pools.read().map_err(poison_err)?;
        Ok(pools
            .get(pool)
            .map(|tasks| tasks.iter().filter(|t| filter.matches(t)).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_many(&self, pool: &str, filter: &TaskFilter) -> Result<u64> {
        let mut pools = self.pools.write().map_err(poison_err)?;
        let Some(tasks) = pools.get_mut(pool) else {
            return Ok(0);
        };

        let before = tasks.len();
        tasks.retain(|t| !filter.matches(t));
        Ok((before - tasks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rolling_core::domain::{TaskDefinition, TaskStatus, WorkerId};
    use serde_json::json;

    fn record(n: u32) -> TaskRecord {
        TaskRecord::new(TaskDefinition::new(json!({"n": n})).unwrap())
    }

    #[tokio::test]
    async fn test_insert_absent_skips_existing() {
        let backend = InMemoryTaskBackend::new();
        let first = backend.insert_absent("pool", &[record(1), record(2)]).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = backend
            .insert_absent("pool", &[record(2), record(3), record(3)])
            .await
            .unwrap();
        assert_eq!(second, vec![record(3).id]);
        assert_eq!(backend.find("pool", &TaskFilter::all()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_pools_are_isolated() {
        let backend = InMemoryTaskBackend::new();
        backend.insert_absent("a", &[record(1)]).await.unwrap();

        assert!(backend.find("b", &TaskFilter::all()).await.unwrap().is_empty());
        assert_eq!(backend.delete_many("b", &TaskFilter::all()).await.unwrap(), 0);
        assert_eq!(backend.delete_many("a", &TaskFilter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_one_and_update_takes_first_match_in_order() {
        let backend = InMemoryTaskBackend::new();
        backend.insert_absent("pool", &[record(1), record(2)]).await.unwrap();
        let now = Utc::now();
        let claim = TaskUpdate::Claim {
            owner: WorkerId::from("w1"),
            lease_expiry: now + Duration::seconds(30),
        };

        let first = backend
            .find_one_and_update("pool", &TaskFilter::claimable(now), &claim, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, record(1).id);
        assert_eq!(first.status, TaskStatus::Running);

        let second = backend
            .find_one_and_update("pool", &TaskFilter::claimable(now), &claim, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, record(2).id);

        let none = backend
            .find_one_and_update("pool", &TaskFilter::claimable(now), &claim, now)
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
