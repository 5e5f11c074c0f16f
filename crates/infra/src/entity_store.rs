//! Versioned entity store boundary.
//!
//! Entities are stored as records: a few indexed columns (type, id, owner,
//! version, state label, updated time) plus the JSON body. `EntityStoreExt`
//! layers typed access over the record-level trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use payrail_billing::{PayoutProfile, Statement, StatementKind};
use payrail_core::{StatementId, VersionedEntity};

use crate::datastore::StoreError;

/// Persisted form of a versioned entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub version: u64,
    pub state: String,
    pub updated_time: DateTime<Utc>,
    pub body: JsonValue,
}

impl EntityRecord {
    pub fn from_entity<E: VersionedEntity>(entity: &E) -> Result<Self, StoreError> {
        let body = serde_json::to_value(entity)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", E::ENTITY_TYPE)))?;
        Ok(Self {
            entity_type: E::ENTITY_TYPE.to_string(),
            id: entity.id().into(),
            owner_id: entity.owner_id(),
            version: entity.version(),
            state: entity.state_label().to_string(),
            updated_time: entity.state_info().updated_time,
            body,
        })
    }

    pub fn into_entity<E: VersionedEntity>(self) -> Result<E, StoreError> {
        if self.entity_type != E::ENTITY_TYPE {
            return Err(StoreError::Serialization(format!(
                "record of type '{}' read as '{}'",
                self.entity_type,
                E::ENTITY_TYPE
            )));
        }
        serde_json::from_value(self.body)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", E::ENTITY_TYPE)))
    }

    pub fn describe(entity_type: &str, id: Uuid) -> String {
        format!("{entity_type}/{id}")
    }
}

/// Transactional CRUD over entity records.
#[async_trait]
pub trait EntityStore: Send {
    /// `NotFound` if absent.
    async fn get_record(&mut self, entity_type: &str, id: Uuid) -> Result<EntityRecord, StoreError>;

    /// `AlreadyExists` if the `(entity_type, id)` pair is taken.
    async fn insert_record(&mut self, record: EntityRecord) -> Result<(), StoreError>;

    /// Full replace; `NotFound` if absent.
    async fn update_record(&mut self, record: EntityRecord) -> Result<(), StoreError>;

    async fn list_records_by_owner(
        &mut self,
        entity_type: &str,
        owner_id: Uuid,
    ) -> Result<Vec<EntityRecord>, StoreError>;
}

/// Typed access to an `EntityStore`.
#[async_trait]
pub trait EntityStoreExt: EntityStore {
    async fn get<E: VersionedEntity>(&mut self, id: E::Id) -> Result<E, StoreError> {
        self.get_record(E::ENTITY_TYPE, id.into()).await?.into_entity()
    }

    async fn insert<E: VersionedEntity>(&mut self, entity: &E) -> Result<(), StoreError> {
        let record = EntityRecord::from_entity(entity)?;
        self.insert_record(record).await
    }

    async fn update<E: VersionedEntity>(&mut self, entity: &E) -> Result<(), StoreError> {
        let record = EntityRecord::from_entity(entity)?;
        self.update_record(record).await
    }

    async fn list_by_owner<E: VersionedEntity>(&mut self, owner_id: Uuid) -> Result<Vec<E>, StoreError> {
        self.list_records_by_owner(E::ENTITY_TYPE, owner_id)
            .await?
            .into_iter()
            .map(EntityRecord::into_entity)
            .collect()
    }
}

impl<T: EntityStore + ?Sized> EntityStoreExt for T {}

/// Payout statement together with the payout profile it settles against.
pub async fn load_payout_statement<T>(
    tx: &mut T,
    statement_id: StatementId,
) -> Result<(Statement, PayoutProfile), StoreError>
where
    T: EntityStore + ?Sized,
{
    let statement: Statement = tx.get(statement_id).await?;
    if statement.kind != StatementKind::Payout {
        return Err(StoreError::NotFound(format!(
            "payout statement {statement_id} (found a billing statement)"
        )));
    }
    let profile: PayoutProfile = tx.get(statement.account_id).await?;
    Ok((statement, profile))
}

/// Failed statements of one kind belonging to an account.
pub async fn count_failed_statements<T>(
    tx: &mut T,
    account_id: Uuid,
    kind: StatementKind,
) -> Result<usize, StoreError>
where
    T: EntityStore + ?Sized,
{
    let statements: Vec<Statement> = tx.list_by_owner(account_id).await?;
    Ok(statements
        .iter()
        .filter(|s| s.kind == kind && s.state() == payrail_billing::StatementState::Failed)
        .count())
}
