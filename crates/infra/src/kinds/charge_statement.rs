use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use payrail_billing::{BillingProfile, Statement, StatementKind};
use payrail_core::{StatementId, VersionedEntity};

use crate::entity_store::{EntityStore, EntityStoreExt};
use crate::external::{ExternalError, PaymentGateway, Settlement};
use crate::tasks::{IdempotencyToken, ProtocolError, TaskHandler, TaskKey, TaskKind, Transition};

use super::{notify_on, settle};

/// Charges a billing statement to the account's gateway customer.
pub struct ChargeStatementHandler {
    gateway: Arc<dyn PaymentGateway>,
}

impl ChargeStatementHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TaskHandler for ChargeStatementHandler {
    type Entity = Statement;
    type Context = BillingProfile;
    type Effect = Settlement;

    fn kind(&self) -> TaskKind {
        TaskKind::ChargeStatement
    }

    async fn load(
        &self,
        tx: &mut dyn EntityStore,
        key: &TaskKey,
    ) -> Result<(Statement, BillingProfile), ProtocolError> {
        let statement: Statement = tx.get(StatementId::from(key.subject_id)).await?;
        if statement.kind != StatementKind::Billing {
            return Err(ProtocolError::EntityNotFound(format!(
                "billing statement {}",
                statement.statement_id
            )));
        }
        let profile: BillingProfile = tx.get(statement.account_id).await?;

        // Nothing to charge against until the customer link lands; the task
        // stays claimed and is picked up again after its backoff.
        if !self.is_stale(key, &statement) && !profile.is_linked() {
            return Err(ProtocolError::PreconditionFailed(format!(
                "billing profile {} has no gateway customer yet",
                profile.account_id
            )));
        }
        Ok((statement, profile))
    }

    async fn execute(
        &self,
        _key: &TaskKey,
        statement: &Statement,
        profile: &BillingProfile,
        token: &IdempotencyToken,
    ) -> Result<Settlement, ExternalError> {
        let customer_id = profile.customer_id.as_deref().ok_or_else(|| {
            ExternalError::Rejected(format!("account {} has no customer", profile.account_id))
        })?;
        let response = self
            .gateway
            .charge(token, customer_id, statement.total, &statement.currency)
            .await;
        Settlement::from_response(response)
    }

    fn apply_transition(
        &self,
        _key: &TaskKey,
        statement: &Statement,
        _profile: &BillingProfile,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> Result<Transition<Statement>, ProtocolError> {
        let next = settle(statement, settlement, now)?;
        info!(
            statement_id = %next.statement_id,
            account_id = %next.account_id,
            state = next.state_label(),
            amount = next.total,
            "billing statement settled"
        );
        Ok(notify_on(next, now))
    }
}
