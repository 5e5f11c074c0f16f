//! Transactional datastore boundary.
//!
//! A `Datastore` hands out transactions; a `Transaction` is both a
//! `TaskStore` and an `EntityStore`, so one atomic read-modify-write can span
//! task rows and entity rows. Dropping a transaction without `commit` rolls it
//! back.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::entity_store::EntityStore;
use crate::tasks::TaskStore;

pub use in_memory::InMemoryDatastore;
pub use postgres::PostgresDatastore;

/// Storage-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// One atomic unit of work over tasks and entities.
#[async_trait]
pub trait Transaction: TaskStore + EntityStore + Send + Sized {
    async fn commit(self) -> Result<(), StoreError>;
}

/// Source of transactions.
#[async_trait]
pub trait Datastore: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

#[async_trait]
impl<D> Datastore for Arc<D>
where
    D: Datastore + ?Sized,
{
    type Tx = D::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }
}
