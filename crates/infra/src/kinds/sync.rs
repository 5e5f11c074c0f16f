//! Outbound state reports to the sibling service.
//!
//! These tasks change nothing locally: the task is keyed to the entity
//! version it reports, so a report superseded by a newer transition is
//! discarded as stale instead of being sent late.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use payrail_billing::{BillingProfile, PayoutProfile, ProfileState, Statement, StatementKind};
use payrail_core::{AccountId, DomainResult, StatementId, VersionedEntity};

use crate::entity_store::{EntityStore, EntityStoreExt};
use crate::external::{ExternalError, SiblingService};
use crate::tasks::{IdempotencyToken, ProtocolError, TaskHandler, TaskKey, TaskKind, Transition};

/// A profile whose state is mirrored to the sibling service.
pub trait SyncedProfile: VersionedEntity<Id = AccountId, State = ProfileState> {
    /// Task kind reporting this profile's state.
    const SYNC_KIND: TaskKind;
    /// Statements whose failures block reactivation.
    const STATEMENT_KIND: StatementKind;

    /// `None` when already suspended.
    fn suspended(&self, now: DateTime<Utc>) -> Option<Self>;

    /// `Ok(None)` when already healthy.
    fn reactivated(&self, failed_statements: usize, now: DateTime<Utc>) -> DomainResult<Option<Self>>;
}

impl SyncedProfile for BillingProfile {
    const SYNC_KIND: TaskKind = TaskKind::SyncBillingProfile;
    const STATEMENT_KIND: StatementKind = StatementKind::Billing;

    fn suspended(&self, now: DateTime<Utc>) -> Option<Self> {
        self.suspend(now)
    }

    fn reactivated(&self, failed_statements: usize, now: DateTime<Utc>) -> DomainResult<Option<Self>> {
        self.reactivate(failed_statements, now)
    }
}

impl SyncedProfile for PayoutProfile {
    const SYNC_KIND: TaskKind = TaskKind::SyncPayoutProfile;
    const STATEMENT_KIND: StatementKind = StatementKind::Payout;

    fn suspended(&self, now: DateTime<Utc>) -> Option<Self> {
        self.suspend(now)
    }

    fn reactivated(&self, failed_statements: usize, now: DateTime<Utc>) -> DomainResult<Option<Self>> {
        self.reactivate(failed_statements, now)
    }
}

/// Reports a profile's state at the task's version.
pub struct SyncProfileHandler<P> {
    sibling: Arc<dyn SiblingService>,
    _profile: PhantomData<fn() -> P>,
}

impl<P> SyncProfileHandler<P> {
    pub fn new(sibling: Arc<dyn SiblingService>) -> Self {
        Self {
            sibling,
            _profile: PhantomData,
        }
    }
}

#[async_trait]
impl<P: SyncedProfile> TaskHandler for SyncProfileHandler<P> {
    type Entity = P;
    type Context = ();
    type Effect = ();

    fn kind(&self) -> TaskKind {
        P::SYNC_KIND
    }

    async fn load(&self, tx: &mut dyn EntityStore, key: &TaskKey) -> Result<(P, ()), ProtocolError> {
        let profile: P = tx.get(AccountId::from(key.subject_id)).await?;
        Ok((profile, ()))
    }

    async fn execute(
        &self,
        _key: &TaskKey,
        profile: &P,
        _context: &(),
        token: &IdempotencyToken,
    ) -> Result<(), ExternalError> {
        self.sibling
            .report_profile_state(
                token,
                P::ENTITY_TYPE,
                profile.id(),
                profile.state_label(),
                profile.version(),
            )
            .await
    }

    fn apply_transition(
        &self,
        _key: &TaskKey,
        _profile: &P,
        _context: &(),
        _effect: (),
        _now: DateTime<Utc>,
    ) -> Result<Transition<P>, ProtocolError> {
        Ok(Transition::none())
    }
}

/// Reports a statement's current state.
pub struct NotifyStatementHandler {
    sibling: Arc<dyn SiblingService>,
}

impl NotifyStatementHandler {
    pub fn new(sibling: Arc<dyn SiblingService>) -> Self {
        Self { sibling }
    }
}

#[async_trait]
impl TaskHandler for NotifyStatementHandler {
    type Entity = Statement;
    type Context = ();
    type Effect = ();

    fn kind(&self) -> TaskKind {
        TaskKind::NotifyStatement
    }

    async fn load(&self, tx: &mut dyn EntityStore, key: &TaskKey) -> Result<(Statement, ()), ProtocolError> {
        let statement: Statement = tx.get(StatementId::from(key.subject_id)).await?;
        Ok((statement, ()))
    }

    async fn execute(
        &self,
        _key: &TaskKey,
        statement: &Statement,
        _context: &(),
        token: &IdempotencyToken,
    ) -> Result<(), ExternalError> {
        self.sibling
            .report_statement_state(
                token,
                statement.statement_id,
                statement.account_id,
                statement.state_label(),
                statement.version(),
            )
            .await
    }

    fn apply_transition(
        &self,
        _key: &TaskKey,
        _statement: &Statement,
        _context: &(),
        _effect: (),
        _now: DateTime<Utc>,
    ) -> Result<Transition<Statement>, ProtocolError> {
        Ok(Transition::none())
    }
}
