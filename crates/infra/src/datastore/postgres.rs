//! Postgres-backed datastore.
//!
//! Expected layout:
//!
//! ```text
//! tasks(kind TEXT, subject_id UUID, version BIGINT, retry_count INT,
//!       execution_time TIMESTAMPTZ, created_time TIMESTAMPTZ,
//!       PRIMARY KEY (kind, subject_id, version))
//!   + INDEX ON tasks (execution_time)
//! entities(entity_type TEXT, id UUID, owner_id UUID NULL, version BIGINT,
//!          state TEXT, updated_time TIMESTAMPTZ, body JSONB,
//!          PRIMARY KEY (entity_type, id))
//!   + INDEX ON entities (entity_type, owner_id)
//! ```
//!
//! Unversioned task keys are stored with `version = 0` (entity versions start
//! at 1), which keeps the primary key free of NULLs.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Backend` |
//! | Row decode failure | N/A | `Serialization` |
//! | Other | N/A | `Backend` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::entity_store::{EntityRecord, EntityStore};
use crate::tasks::{Task, TaskKey, TaskKind, TaskMetadata, TaskStore};

use super::{Datastore, StoreError, Transaction};

/// Postgres datastore; transactions are plain `BEGIN … COMMIT` with row locks
/// (`FOR UPDATE`) on every read that precedes a write.
#[derive(Debug, Clone)]
pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using a database URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgTransaction { tx })
    }
}

/// Open Postgres transaction; rolled back on drop unless committed.
#[derive(Debug)]
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

fn version_column(key: &TaskKey) -> i64 {
    key.version.map(|v| v as i64).unwrap_or(0)
}

#[async_trait]
impl TaskStore for PgTransaction {
    #[instrument(skip(self), fields(task = %task.key), err)]
    async fn insert_task(&mut self, task: Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (kind, subject_id, version, retry_count, execution_time, created_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(task.key.kind.as_str())
        .bind(task.key.subject_id)
        .bind(version_column(&task.key))
        .bind(task.retry_count as i32)
        .bind(task.execution_time)
        .bind(task.created_time)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(format!("task {}", task.key))
            } else {
                map_sqlx_error("insert_task", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(task = %key), err)]
    async fn delete_task(&mut self, key: &TaskKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE kind = $1 AND subject_id = $2 AND version = $3
            "#,
        )
        .bind(key.kind.as_str())
        .bind(key.subject_id)
        .bind(version_column(key))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_task", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(task = %key), err)]
    async fn get_task_metadata(&mut self, key: &TaskKey) -> Result<TaskMetadata, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT retry_count, execution_time, created_time
            FROM tasks
            WHERE kind = $1 AND subject_id = $2 AND version = $3
            FOR UPDATE
            "#,
        )
        .bind(key.kind.as_str())
        .bind(key.subject_id)
        .bind(version_column(key))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_task_metadata", e))?
        .ok_or_else(|| StoreError::NotFound(format!("task {key}")))?;

        let retry_count: i32 = row.try_get("retry_count").map_err(decode_error)?;
        Ok(TaskMetadata {
            retry_count: retry_count.max(0) as u32,
            execution_time: row.try_get("execution_time").map_err(decode_error)?,
            created_time: row.try_get("created_time").map_err(decode_error)?,
        })
    }

    #[instrument(skip(self), fields(task = %key), err)]
    async fn update_task_metadata(
        &mut self,
        key: &TaskKey,
        retry_count: u32,
        execution_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET retry_count = $4, execution_time = $5
            WHERE kind = $1 AND subject_id = $2 AND version = $3
            "#,
        )
        .bind(key.kind.as_str())
        .bind(key.subject_id)
        .bind(version_column(key))
        .bind(retry_count.min(i32::MAX as u32) as i32)
        .bind(execution_time)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_task_metadata", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {key}")));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_due_tasks(&mut self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT kind, subject_id, version
            FROM tasks
            WHERE execution_time <= $1
            ORDER BY execution_time ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_due_tasks", e))?;

        task_keys_from_rows(&rows)
    }

    #[instrument(skip(self), err)]
    async fn list_subject_tasks(&mut self, kind: TaskKind, subject_id: Uuid) -> Result<Vec<TaskKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT kind, subject_id, version
            FROM tasks
            WHERE kind = $1 AND subject_id = $2
            FOR UPDATE
            "#,
        )
        .bind(kind.as_str())
        .bind(subject_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_subject_tasks", e))?;

        task_keys_from_rows(&rows)
    }
}

#[async_trait]
impl EntityStore for PgTransaction {
    #[instrument(skip(self), err)]
    async fn get_record(&mut self, entity_type: &str, id: Uuid) -> Result<EntityRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, id, owner_id, version, state, updated_time, body
            FROM entities
            WHERE entity_type = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_record", e))?
        .ok_or_else(|| StoreError::NotFound(EntityRecord::describe(entity_type, id)))?;

        entity_record_from_row(&row)
    }

    #[instrument(skip(self, record), fields(entity_type = %record.entity_type, id = %record.id), err)]
    async fn insert_record(&mut self, record: EntityRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO entities (entity_type, id, owner_id, version, state, updated_time, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.entity_type)
        .bind(record.id)
        .bind(record.owner_id)
        .bind(record.version as i64)
        .bind(&record.state)
        .bind(record.updated_time)
        .bind(&record.body)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(EntityRecord::describe(&record.entity_type, record.id))
            } else {
                map_sqlx_error("insert_record", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(entity_type = %record.entity_type, id = %record.id), err)]
    async fn update_record(&mut self, record: EntityRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET owner_id = $3, version = $4, state = $5, updated_time = $6, body = $7
            WHERE entity_type = $1 AND id = $2
            "#,
        )
        .bind(&record.entity_type)
        .bind(record.id)
        .bind(record.owner_id)
        .bind(record.version as i64)
        .bind(&record.state)
        .bind(record.updated_time)
        .bind(&record.body)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_record", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(EntityRecord::describe(
                &record.entity_type,
                record.id,
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_records_by_owner(
        &mut self,
        entity_type: &str,
        owner_id: Uuid,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, id, owner_id, version, state, updated_time, body
            FROM entities
            WHERE entity_type = $1 AND owner_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(entity_type)
        .bind(owner_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_records_by_owner", e))?;

        rows.iter().map(entity_record_from_row).collect()
    }
}

/// Rows with a kind this build does not know are skipped, so one foreign row
/// cannot block every poll.
fn task_keys_from_rows(rows: &[PgRow]) -> Result<Vec<TaskKey>, StoreError> {
    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.try_get("kind").map_err(decode_error)?;
        let subject_id: Uuid = row.try_get("subject_id").map_err(decode_error)?;
        let version: i64 = row.try_get("version").map_err(decode_error)?;
        match task_key_from_columns(&kind, subject_id, version) {
            Some(key) => keys.push(key),
            None => warn!(kind = %kind, %subject_id, version, "skipping task row with unknown kind"),
        }
    }
    Ok(keys)
}

fn task_key_from_columns(kind: &str, subject_id: Uuid, version: i64) -> Option<TaskKey> {
    Some(TaskKey {
        kind: TaskKind::parse(kind)?,
        subject_id,
        version: (version > 0).then_some(version as u64),
    })
}

fn entity_record_from_row(row: &PgRow) -> Result<EntityRecord, StoreError> {
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(EntityRecord {
        entity_type: row.try_get("entity_type").map_err(decode_error)?,
        id: row.try_get("id").map_err(decode_error)?,
        owner_id: row.try_get("owner_id").map_err(decode_error)?,
        version: version.max(0) as u64,
        state: row.try_get("state").map_err(decode_error)?,
        updated_time: row.try_get("updated_time").map_err(decode_error)?,
        body: row.try_get("body").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(format!("failed to decode row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => StoreError::AlreadyExists(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        other => StoreError::Backend(format!("error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_columns_map_version_zero_to_unversioned() {
        let subject = Uuid::now_v7();

        let key = task_key_from_columns("create_customer", subject, 0).unwrap();
        assert_eq!(key, TaskKey::new(TaskKind::CreateCustomer, subject));

        let key = task_key_from_columns("notify_statement", subject, 3).unwrap();
        assert_eq!(key, TaskKey::versioned(TaskKind::NotifyStatement, subject, 3));
    }

    #[test]
    fn unknown_task_kind_is_skipped() {
        assert_eq!(task_key_from_columns("archive_statement", Uuid::now_v7(), 1), None);
    }
}
