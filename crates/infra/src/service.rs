//! Call-site operations that create or transition entities and seed the
//! tasks that carry the resulting work out.
//!
//! Each operation is one transaction: the entity write and the task writes
//! commit together or not at all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use payrail_billing::{BillingProfile, PayoutProfile, Statement, StatementKind};
use payrail_core::{AccountId, Clock, Currency, DomainError, IdGenerator, LineItem, StatementId, VersionedEntity};

use crate::datastore::{Datastore, StoreError, Transaction};
use crate::entity_store::{EntityStoreExt, count_failed_statements};
use crate::kinds::SyncedProfile;
use crate::tasks::{Cascade, Task, TaskKey, TaskKind, TaskStore, apply_cascade};

/// Failure surfaced to the caller of a service operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error(transparent)]
    Domain(DomainError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Store(other),
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::PreconditionFailed(msg) => ServiceError::PreconditionFailed(msg),
            other => ServiceError::Domain(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Entry point for account, profile and statement operations.
pub struct BillingService<D> {
    datastore: D,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl<D: Datastore> BillingService<D> {
    pub fn new(datastore: D, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { datastore, clock, ids }
    }

    /// Create the billing profile and seed its customer-creation task.
    ///
    /// Idempotent: an existing profile is returned unchanged.
    pub async fn create_billing_profile(
        &self,
        account_id: AccountId,
        currency: Currency,
        payment_after: DateTime<Utc>,
    ) -> ServiceResult<BillingProfile> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;

        if let Some(existing) = find::<BillingProfile, _>(&mut tx, account_id).await? {
            debug!(%account_id, "billing profile already exists");
            return Ok(existing);
        }

        let profile = BillingProfile::create(account_id, currency, payment_after, now);
        tx.insert(&profile).await?;
        tx.insert_task(Task::new(TaskKey::new(TaskKind::CreateCustomer, account_id), now))
            .await?;
        tx.commit().await?;

        info!(%account_id, currency = %profile.currency, %payment_after, "billing profile created");
        Ok(profile)
    }

    /// Create the payout profile and announce it to the sibling service.
    ///
    /// Idempotent: an existing profile is returned unchanged.
    pub async fn create_payout_profile(
        &self,
        account_id: AccountId,
        currency: Currency,
        connected_account_id: impl Into<String>,
    ) -> ServiceResult<PayoutProfile> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;

        if let Some(existing) = find::<PayoutProfile, _>(&mut tx, account_id).await? {
            debug!(%account_id, "payout profile already exists");
            return Ok(existing);
        }

        let profile = PayoutProfile::create(account_id, currency, connected_account_id, now)?;
        tx.insert(&profile).await?;
        tx.insert_task(Task::new(
            TaskKey::versioned(TaskKind::SyncPayoutProfile, account_id, profile.version()),
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(%account_id, currency = %profile.currency, "payout profile created");
        Ok(profile)
    }

    pub async fn suspend_billing_profile(&self, account_id: AccountId) -> ServiceResult<BillingProfile> {
        self.suspend::<BillingProfile>(account_id).await
    }

    pub async fn reactivate_billing_profile(&self, account_id: AccountId) -> ServiceResult<BillingProfile> {
        self.reactivate::<BillingProfile>(account_id).await
    }

    pub async fn suspend_payout_profile(&self, account_id: AccountId) -> ServiceResult<PayoutProfile> {
        self.suspend::<PayoutProfile>(account_id).await
    }

    pub async fn reactivate_payout_profile(&self, account_id: AccountId) -> ServiceResult<PayoutProfile> {
        self.reactivate::<PayoutProfile>(account_id).await
    }

    /// Suspend a profile; a no-op (same version, no tasks) when it already is.
    async fn suspend<P: SyncedProfile>(&self, account_id: AccountId) -> ServiceResult<P> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;
        let profile: P = tx.get(account_id).await?;

        let Some(next) = profile.suspended(now) else {
            debug!(%account_id, profile_type = P::ENTITY_TYPE, "profile already suspended");
            return Ok(profile);
        };
        self.commit_profile(tx, next, now).await
    }

    /// Reactivate a suspended profile once no failed statements remain.
    async fn reactivate<P: SyncedProfile>(&self, account_id: AccountId) -> ServiceResult<P> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;
        let profile: P = tx.get(account_id).await?;

        let failed = count_failed_statements(&mut tx, account_id.into(), P::STATEMENT_KIND).await?;
        let Some(next) = profile.reactivated(failed, now)? else {
            debug!(%account_id, profile_type = P::ENTITY_TYPE, "profile already healthy");
            return Ok(profile);
        };
        self.commit_profile(tx, next, now).await
    }

    async fn commit_profile<P: SyncedProfile>(&self, mut tx: D::Tx, next: P, now: DateTime<Utc>) -> ServiceResult<P> {
        tx.update(&next).await?;
        let sync = Task::new(TaskKey::versioned(P::SYNC_KIND, next.id(), next.version()), now);
        apply_cascade(&mut tx, vec![Cascade::Schedule(sync)]).await?;
        tx.commit().await?;

        info!(
            account_id = %next.id(),
            profile_type = P::ENTITY_TYPE,
            state = next.state_label(),
            version = next.version(),
            "profile state changed"
        );
        Ok(next)
    }

    /// Record a billing statement reported by the usage pipeline and schedule
    /// its charge, never before the profile's `payment_after`.
    ///
    /// Idempotent on `statement_id`.
    pub async fn report_billing_statement(
        &self,
        statement_id: StatementId,
        account_id: AccountId,
        line_items: Vec<LineItem>,
    ) -> ServiceResult<Statement> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;

        if let Some(existing) = find::<Statement, _>(&mut tx, statement_id).await? {
            if existing.account_id != account_id || existing.kind != StatementKind::Billing {
                return Err(DomainError::conflict(format!(
                    "statement {statement_id} already exists for a different account or kind"
                ))
                .into());
            }
            return Ok(existing);
        }

        let profile: BillingProfile = tx.get(account_id).await?;
        let statement = Statement::open(
            statement_id,
            account_id,
            StatementKind::Billing,
            profile.currency.clone(),
            line_items,
            now,
        )?;
        let charge = TaskKey::versioned(TaskKind::ChargeStatement, statement_id, statement.version());

        tx.insert(&statement).await?;
        tx.insert_task(Task::scheduled_at(charge, profile.payment_after, now))
            .await?;
        tx.commit().await?;

        info!(
            %statement_id,
            %account_id,
            total = statement.total,
            charge_at = %profile.payment_after.max(now),
            "billing statement reported"
        );
        Ok(statement)
    }

    /// Open a payout statement and schedule its transfer.
    pub async fn open_payout_statement(
        &self,
        account_id: AccountId,
        line_items: Vec<LineItem>,
    ) -> ServiceResult<Statement> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;

        let profile: PayoutProfile = tx.get(account_id).await?;
        let statement_id = StatementId::from(self.ids.next_id());
        let statement = Statement::open(
            statement_id,
            account_id,
            StatementKind::Payout,
            profile.currency.clone(),
            line_items,
            now,
        )?;
        let transfer = TaskKey::versioned(TaskKind::TransferPayout, statement_id, statement.version());

        tx.insert(&statement).await?;
        tx.insert_task(Task::new(transfer, now)).await?;
        tx.commit().await?;

        info!(%statement_id, %account_id, total = statement.total, "payout statement opened");
        Ok(statement)
    }

    /// Move a failed statement back to processing and schedule a new attempt
    /// at the new version.
    ///
    /// The sibling is told about the reopened statement through a notify task
    /// at the new version, which also supersedes the pending one for the
    /// failure.
    pub async fn retry_statement(&self, statement_id: StatementId) -> ServiceResult<Statement> {
        let now = self.clock.now();
        let mut tx = self.datastore.begin().await?;

        let statement: Statement = tx.get(statement_id).await?;
        let retried = statement.retry(now)?;
        let kind = match retried.kind {
            StatementKind::Billing => TaskKind::ChargeStatement,
            StatementKind::Payout => TaskKind::TransferPayout,
        };

        tx.update(&retried).await?;
        let attempt = Task::new(TaskKey::versioned(kind, statement_id, retried.version()), now);
        let notify = Task::new(
            TaskKey::versioned(TaskKind::NotifyStatement, statement_id, retried.version()),
            now,
        );
        apply_cascade(&mut tx, vec![Cascade::Schedule(attempt), Cascade::Schedule(notify)]).await?;
        tx.commit().await?;

        info!(%statement_id, version = retried.version(), "statement retry scheduled");
        Ok(retried)
    }

    pub async fn billing_profile(&self, account_id: AccountId) -> ServiceResult<BillingProfile> {
        let mut tx = self.datastore.begin().await?;
        Ok(tx.get(account_id).await?)
    }

    pub async fn payout_profile(&self, account_id: AccountId) -> ServiceResult<PayoutProfile> {
        let mut tx = self.datastore.begin().await?;
        Ok(tx.get(account_id).await?)
    }

    pub async fn statement(&self, statement_id: StatementId) -> ServiceResult<Statement> {
        let mut tx = self.datastore.begin().await?;
        Ok(tx.get(statement_id).await?)
    }

    /// Statements of an account, both kinds.
    pub async fn statements(&self, account_id: AccountId) -> ServiceResult<Vec<Statement>> {
        let mut tx = self.datastore.begin().await?;
        let owner: Uuid = account_id.into();
        Ok(tx.list_by_owner(owner).await?)
    }
}

/// `Ok(None)` instead of `NotFound`.
async fn find<E, T>(tx: &mut T, id: E::Id) -> Result<Option<E>, StoreError>
where
    E: VersionedEntity,
    T: EntityStoreExt + ?Sized,
{
    match tx.get::<E>(id).await {
        Ok(entity) => Ok(Some(entity)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
