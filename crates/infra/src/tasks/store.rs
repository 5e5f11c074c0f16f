//! Durable task store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::datastore::StoreError;

use super::types::{Task, TaskKey, TaskKind, TaskMetadata};

/// Transactional CRUD over task rows.
///
/// Implemented by a datastore's transaction type: every call runs inside the
/// caller's transaction and the store itself never commits.
#[async_trait]
pub trait TaskStore: Send {
    /// Insert a task; `AlreadyExists` if the key is taken.
    async fn insert_task(&mut self, task: Task) -> Result<(), StoreError>;

    /// Delete a task; returns whether a row was removed.
    async fn delete_task(&mut self, key: &TaskKey) -> Result<bool, StoreError>;

    /// Read retry count and visibility; `NotFound` if absent.
    async fn get_task_metadata(&mut self, key: &TaskKey) -> Result<TaskMetadata, StoreError>;

    /// Overwrite retry count and visibility; `NotFound` if absent.
    async fn update_task_metadata(
        &mut self,
        key: &TaskKey,
        retry_count: u32,
        execution_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Keys with `execution_time <= now`, oldest first, at most `limit`.
    async fn list_due_tasks(&mut self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskKey>, StoreError>;

    /// Every task of `kind` for `subject_id`, whatever its version.
    async fn list_subject_tasks(&mut self, kind: TaskKind, subject_id: Uuid) -> Result<Vec<TaskKey>, StoreError>;
}
