//! Claim / execute / commit protocol for durable tasks.
//!
//! One task attempt is two transactions with the external call in between:
//!
//! 1. `claim`: bump `retry_count` and push `execution_time` to
//!    `now + backoff(retry_count)` so a crashed attempt is retried no sooner
//!    than that.
//! 2. `process`: load the entity, run the handler's single external call with
//!    the key's idempotency token, then in a fresh transaction re-read the
//!    entity, check its version, write the transition, delete the task and
//!    apply the cascade.
//!
//! No transaction is held across the external call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use payrail_core::{Clock, DomainError, ExpectedVersion, VersionedEntity};

use crate::datastore::{Datastore, StoreError, Transaction};
use crate::entity_store::{EntityStore, EntityStoreExt};
use crate::external::ExternalError;

use super::backoff::BackoffPolicy;
use super::store::TaskStore;
use super::types::{IdempotencyToken, Task, TaskKey, TaskKind};

/// Failure of a claim or process step.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskKey),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("task {key} expected entity version {expected}, found {actual}")]
    StaleVersion { key: TaskKey, expected: u64, actual: u64 },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("external call for {key} failed: {source}")]
    ExternalCallFailed {
        key: TaskKey,
        #[source]
        source: ExternalError,
    },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("no handler registered for task kind {0}")]
    NoHandler(TaskKind),

    #[error(transparent)]
    Store(StoreError),
}

impl ProtocolError {
    /// Whether the next claim of the same task may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::ExternalCallFailed { .. }
                | ProtocolError::StaleVersion { .. }
                | ProtocolError::PreconditionFailed(_)
                | ProtocolError::Store(StoreError::Backend(_))
        )
    }
}

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ProtocolError::EntityNotFound(what),
            other => ProtocolError::Store(other),
        }
    }
}

impl From<DomainError> for ProtocolError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::PreconditionFailed(msg) => ProtocolError::PreconditionFailed(msg),
            other => ProtocolError::InvalidTransition(other.to_string()),
        }
    }
}

/// Follow-up work produced by a committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cascade {
    /// Insert the task and cancel every task of the same kind and subject
    /// keyed to an older version.
    Schedule(Task),
    /// Remove one specific pending task, if present.
    Cancel(TaskKey),
}

/// Outcome of `TaskHandler::apply_transition`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<E> {
    /// New entity state; `None` when the task changes nothing locally.
    pub entity: Option<E>,
    pub cascade: Vec<Cascade>,
}

impl<E> Transition<E> {
    pub fn none() -> Self {
        Self {
            entity: None,
            cascade: Vec::new(),
        }
    }

    pub fn to(entity: E) -> Self {
        Self {
            entity: Some(entity),
            cascade: Vec::new(),
        }
    }

    pub fn schedule(mut self, task: Task) -> Self {
        self.cascade.push(Cascade::Schedule(task));
        self
    }

    pub fn cancel(mut self, key: TaskKey) -> Self {
        self.cascade.push(Cascade::Cancel(key));
        self
    }
}

/// Apply cascade entries inside the caller's transaction.
///
/// Re-scheduling a task that already exists is not an error, so a call site
/// that is retried after a partial failure converges on the same rows.
pub async fn apply_cascade<T>(tx: &mut T, cascade: Vec<Cascade>) -> Result<(), StoreError>
where
    T: TaskStore + ?Sized,
{
    for entry in cascade {
        match entry {
            Cascade::Schedule(task) => {
                if let Some(version) = task.key.version {
                    for existing in tx.list_subject_tasks(task.key.kind, task.key.subject_id).await? {
                        if existing.version.is_some_and(|v| v < version) {
                            tx.delete_task(&existing).await?;
                            debug!(task = %existing, superseded_by = version, "cancelled superseded task");
                        }
                    }
                }
                match tx.insert_task(task).await {
                    Ok(()) => debug!(task = %task.key, at = %task.execution_time, "scheduled task"),
                    Err(StoreError::AlreadyExists(_)) => {
                        debug!(task = %task.key, "task already scheduled")
                    }
                    Err(e) => return Err(e),
                }
            }
            Cascade::Cancel(key) => {
                if tx.delete_task(&key).await? {
                    debug!(task = %key, "cancelled task");
                }
            }
        }
    }
    Ok(())
}

/// Per-kind behaviour plugged into `TaskProtocol`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Entity whose version gates this task.
    type Entity: VersionedEntity;
    /// Extra data read alongside the entity (e.g. the profile a statement
    /// settles against).
    type Context: Send + Sync + 'static;
    /// Result of the external call, consumed by `apply_transition`.
    type Effect: Send + 'static;

    fn kind(&self) -> TaskKind;

    /// Read the entity (and context) the task acts on.
    async fn load(
        &self,
        tx: &mut dyn EntityStore,
        key: &TaskKey,
    ) -> Result<(Self::Entity, Self::Context), ProtocolError>;

    /// Whether the task's work is already superseded. Defaults to comparing
    /// the key's version with the entity's.
    fn is_stale(&self, key: &TaskKey, entity: &Self::Entity) -> bool {
        key.version.is_some_and(|v| v != entity.version())
    }

    /// The single external call of one attempt.
    async fn execute(
        &self,
        key: &TaskKey,
        entity: &Self::Entity,
        context: &Self::Context,
        token: &IdempotencyToken,
    ) -> Result<Self::Effect, ExternalError>;

    /// Pure state transition over the freshly re-read entity.
    fn apply_transition(
        &self,
        key: &TaskKey,
        entity: &Self::Entity,
        context: &Self::Context,
        effect: Self::Effect,
        now: DateTime<Utc>,
    ) -> Result<Transition<Self::Entity>, ProtocolError>;
}

/// Result of a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub key: TaskKey,
    /// Retry count after the claim.
    pub retry_count: u32,
    /// When the task becomes visible again if this attempt does not finish.
    pub execution_time: DateTime<Utc>,
    /// Task outlived the maximum age; still processed, but worth an alert.
    pub expired: bool,
}

/// How a `process` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Transition (if any) committed and the task deleted.
    Committed { version: u64 },
    /// Task was superseded; deleted without touching the entity.
    Stale { current_version: u64 },
}

/// Generic claim/process driver over a datastore.
pub struct TaskProtocol<D> {
    datastore: D,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl<D> Clone for TaskProtocol<D>
where
    D: Clone,
{
    fn clone(&self) -> Self {
        Self {
            datastore: self.datastore.clone(),
            backoff: self.backoff,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<D> std::fmt::Debug for TaskProtocol<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProtocol")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<D: Datastore> TaskProtocol<D> {
    pub fn new(datastore: D, backoff: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            datastore,
            backoff,
            clock,
        }
    }

    pub fn datastore(&self) -> &D {
        &self.datastore
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Lease a task: advance its retry count and visibility in one
    /// transaction.
    pub async fn claim(&self, key: &TaskKey) -> Result<Claim, ProtocolError> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;

        let metadata = tx.get_task_metadata(key).await.map_err(|e| task_error(key, e))?;
        let execution_time = self.backoff.next_execution_time(now, metadata.retry_count);
        let retry_count = metadata.retry_count.saturating_add(1);

        tx.update_task_metadata(key, retry_count, execution_time)
            .await
            .map_err(|e| task_error(key, e))?;
        tx.commit().await?;

        let expired = self.backoff.is_expired(metadata.created_time, now);
        if expired {
            warn!(
                task = %key,
                retry_count,
                created_time = %metadata.created_time,
                "task exceeded maximum age"
            );
        } else {
            debug!(task = %key, retry_count, next_visible = %execution_time, "claimed task");
        }

        Ok(Claim {
            key: *key,
            retry_count,
            execution_time,
            expired,
        })
    }

    /// Keys of tasks that are due now, oldest first.
    pub async fn list_due(&self, limit: usize) -> Result<Vec<TaskKey>, ProtocolError> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;
        Ok(tx.list_due_tasks(now, limit).await?)
    }

    /// Run one attempt of a claimed task through `handler`.
    pub async fn process<H>(&self, handler: &H, key: &TaskKey) -> Result<ProcessOutcome, ProtocolError>
    where
        H: TaskHandler,
    {
        if handler.kind() != key.kind {
            return Err(ProtocolError::NoHandler(key.kind));
        }

        // Entity rows are locked before task rows, the same order the
        // service operations use, so concurrent commits cannot deadlock.
        let (entity, context) = {
            let mut tx = self.datastore.begin().await?;
            let loaded = handler.load(&mut tx, key).await?;
            tx.get_task_metadata(key).await.map_err(|e| task_error(key, e))?;
            loaded
        };

        if handler.is_stale(key, &entity) {
            let mut tx = self.datastore.begin().await?;
            tx.delete_task(key).await?;
            tx.commit().await?;
            warn!(task = %key, current_version = entity.version(), "discarded stale task");
            return Ok(ProcessOutcome::Stale {
                current_version: entity.version(),
            });
        }

        let token = key.idempotency_token();
        let effect = handler
            .execute(key, &entity, &context, &token)
            .await
            .map_err(|source| {
                warn!(task = %key, error = %source, "external call failed");
                ProtocolError::ExternalCallFailed { key: *key, source }
            })?;

        let mut tx = self.datastore.begin().await?;
        let (fresh, fresh_context) = handler.load(&mut tx, key).await?;
        tx.get_task_metadata(key).await.map_err(|e| task_error(key, e))?;

        if handler.is_stale(key, &fresh) {
            tx.delete_task(key).await?;
            tx.commit().await?;
            warn!(task = %key, current_version = fresh.version(), "task went stale during execution");
            return Ok(ProcessOutcome::Stale {
                current_version: fresh.version(),
            });
        }
        if !ExpectedVersion::Exact(entity.version()).matches(fresh.version()) {
            return Err(ProtocolError::StaleVersion {
                key: *key,
                expected: entity.version(),
                actual: fresh.version(),
            });
        }

        let now = self.clock.now();
        let transition = handler.apply_transition(key, &fresh, &fresh_context, effect, now)?;
        let version = match &transition.entity {
            Some(next) => {
                check_successor(&fresh, next)?;
                tx.update(next).await?;
                next.version()
            }
            None => fresh.version(),
        };

        if !tx.delete_task(key).await? {
            return Err(ProtocolError::TaskNotFound(*key));
        }
        apply_cascade(&mut tx, transition.cascade).await?;
        tx.commit().await?;

        let entity_type = <H::Entity as VersionedEntity>::ENTITY_TYPE;
        info!(
            task = %key,
            entity_type,
            entity_id = %fresh.id(),
            from_version = fresh.version(),
            to_version = version,
            "committed task"
        );
        Ok(ProcessOutcome::Committed { version })
    }
}

fn task_error(key: &TaskKey, err: StoreError) -> ProtocolError {
    match err {
        StoreError::NotFound(_) => ProtocolError::TaskNotFound(*key),
        other => ProtocolError::Store(other),
    }
}

fn check_successor<E: VersionedEntity>(current: &E, next: &E) -> Result<(), ProtocolError> {
    if next.id() != current.id() {
        return Err(ProtocolError::InvalidTransition(format!(
            "{} transition changed id {} to {}",
            E::ENTITY_TYPE,
            current.id(),
            next.id()
        )));
    }
    if next.version() != current.version() + 1 {
        return Err(ProtocolError::InvalidTransition(format!(
            "{} {} transition from version {} to {}",
            E::ENTITY_TYPE,
            current.id(),
            current.version(),
            next.version()
        )));
    }
    Ok(())
}
