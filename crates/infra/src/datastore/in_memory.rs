use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::entity_store::{EntityRecord, EntityStore};
use crate::tasks::{Task, TaskKey, TaskKind, TaskMetadata, TaskStore};

use super::{Datastore, StoreError, Transaction};

#[derive(Debug, Clone, Default)]
struct Tables {
    tasks: BTreeMap<TaskKey, Task>,
    entities: BTreeMap<(String, Uuid), EntityRecord>,
}

/// In-memory transactional datastore.
///
/// Intended for tests/dev. Transactions are serializable: `begin` takes the
/// single table lock and works on a copy that replaces the tables on
/// `commit`. Dropping an uncommitted transaction discards the copy.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatastore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all task rows, ordered by key.
    pub async fn tasks(&self) -> Vec<Task> {
        self.tables.lock().await.tasks.values().copied().collect()
    }

    /// Snapshot of the task rows of one kind.
    pub async fn tasks_of_kind(&self, kind: TaskKind) -> Vec<Task> {
        self.tables
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.key.kind == kind)
            .copied()
            .collect()
    }

    pub async fn entity_count(&self, entity_type: &str) -> usize {
        self.tables
            .lock()
            .await
            .entities
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction { guard, working })
    }
}

/// Transaction over an `InMemoryDatastore`.
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTransaction { mut guard, working } = self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTransaction {
    async fn insert_task(&mut self, task: Task) -> Result<(), StoreError> {
        if self.working.tasks.contains_key(&task.key) {
            return Err(StoreError::AlreadyExists(format!("task {}", task.key)));
        }
        self.working.tasks.insert(task.key, task);
        Ok(())
    }

    async fn delete_task(&mut self, key: &TaskKey) -> Result<bool, StoreError> {
        Ok(self.working.tasks.remove(key).is_some())
    }

    async fn get_task_metadata(&mut self, key: &TaskKey) -> Result<TaskMetadata, StoreError> {
        self.working
            .tasks
            .get(key)
            .map(Task::metadata)
            .ok_or_else(|| StoreError::NotFound(format!("task {key}")))
    }

    async fn update_task_metadata(
        &mut self,
        key: &TaskKey,
        retry_count: u32,
        execution_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let task = self
            .working
            .tasks
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("task {key}")))?;
        task.retry_count = retry_count;
        task.execution_time = execution_time;
        Ok(())
    }

    async fn list_due_tasks(&mut self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskKey>, StoreError> {
        let mut due: Vec<&Task> = self.working.tasks.values().filter(|t| t.is_due(now)).collect();
        due.sort_by_key(|t| (t.execution_time, t.key));
        Ok(due.into_iter().take(limit).map(|t| t.key).collect())
    }

    async fn list_subject_tasks(&mut self, kind: TaskKind, subject_id: Uuid) -> Result<Vec<TaskKey>, StoreError> {
        Ok(self
            .working
            .tasks
            .keys()
            .filter(|k| k.kind == kind && k.subject_id == subject_id)
            .copied()
            .collect())
    }
}

#[async_trait]
impl EntityStore for InMemoryTransaction {
    async fn get_record(&mut self, entity_type: &str, id: Uuid) -> Result<EntityRecord, StoreError> {
        self.working
            .entities
            .get(&(entity_type.to_string(), id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(EntityRecord::describe(entity_type, id)))
    }

    async fn insert_record(&mut self, record: EntityRecord) -> Result<(), StoreError> {
        let key = (record.entity_type.clone(), record.id);
        if self.working.entities.contains_key(&key) {
            return Err(StoreError::AlreadyExists(EntityRecord::describe(&key.0, key.1)));
        }
        self.working.entities.insert(key, record);
        Ok(())
    }

    async fn update_record(&mut self, record: EntityRecord) -> Result<(), StoreError> {
        let key = (record.entity_type.clone(), record.id);
        match self.working.entities.get_mut(&key) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(EntityRecord::describe(&key.0, key.1))),
        }
    }

    async fn list_records_by_owner(
        &mut self,
        entity_type: &str,
        owner_id: Uuid,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        Ok(self
            .working
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type && r.owner_id == Some(owner_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::EntityStoreExt;
    use chrono::Duration;
    use payrail_billing::BillingProfile;
    use payrail_core::{AccountId, Currency, VersionedEntity};

    fn key(kind: TaskKind) -> TaskKey {
        TaskKey::versioned(kind, Uuid::now_v7(), 1)
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_keys() {
        let store = InMemoryDatastore::new();
        let now = Utc::now();
        let k = key(TaskKind::NotifyStatement);

        let mut tx = store.begin().await.unwrap();
        tx.insert_task(Task::new(k, now)).await.unwrap();
        let err = tx.insert_task(Task::new(k, now)).await.unwrap_err();
        assert!(err.is_already_exists());
        tx.commit().await.unwrap();

        assert_eq!(store.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryDatastore::new();
        let now = Utc::now();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_task(Task::new(key(TaskKind::CreateCustomer), now))
                .await
                .unwrap();
        }

        assert!(store.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn missing_metadata_is_not_found() {
        let store = InMemoryDatastore::new();
        let mut tx = store.begin().await.unwrap();
        let k = key(TaskKind::ChargeStatement);

        assert!(tx.get_task_metadata(&k).await.unwrap_err().is_not_found());
        assert!(
            tx.update_task_metadata(&k, 1, Utc::now())
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(!tx.delete_task(&k).await.unwrap());
    }

    #[tokio::test]
    async fn list_due_is_ordered_and_limited() {
        let store = InMemoryDatastore::new();
        let now = Utc::now();
        let late = key(TaskKind::NotifyStatement);
        let early = key(TaskKind::NotifyStatement);
        let future = key(TaskKind::NotifyStatement);

        let mut tx = store.begin().await.unwrap();
        tx.insert_task(Task::scheduled_at(late, now, now - Duration::minutes(1)))
            .await
            .unwrap();
        tx.insert_task(Task::scheduled_at(
            early,
            now - Duration::minutes(5),
            now - Duration::minutes(10),
        ))
        .await
        .unwrap();
        tx.insert_task(Task::scheduled_at(future, now + Duration::minutes(1), now))
            .await
            .unwrap();

        assert_eq!(tx.list_due_tasks(now, 10).await.unwrap(), vec![early, late]);
        assert_eq!(tx.list_due_tasks(now, 1).await.unwrap(), vec![early]);
    }

    #[tokio::test]
    async fn entities_round_trip_through_records() {
        let store = InMemoryDatastore::new();
        let now = Utc::now();
        let profile = BillingProfile::create(AccountId::new(), Currency::new("USD").unwrap(), now, now);

        let mut tx = store.begin().await.unwrap();
        tx.insert(&profile).await.unwrap();
        assert!(tx.insert(&profile).await.unwrap_err().is_already_exists());

        let suspended = profile.suspend(now).unwrap();
        tx.update(&suspended).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let loaded: BillingProfile = tx.get(profile.account_id).await.unwrap();
        assert_eq!(loaded, suspended);
        assert_eq!(loaded.version(), 2);

        let owned: Vec<BillingProfile> = tx.list_by_owner(*profile.account_id.as_uuid()).await.unwrap();
        assert_eq!(owned.len(), 1);
    }
}
