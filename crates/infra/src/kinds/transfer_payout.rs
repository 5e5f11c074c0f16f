use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use payrail_billing::{PayoutProfile, Statement};
use payrail_core::{StatementId, VersionedEntity};

use crate::entity_store::{EntityStore, load_payout_statement};
use crate::external::{ExternalError, PaymentGateway, Settlement};
use crate::tasks::{IdempotencyToken, ProtocolError, TaskHandler, TaskKey, TaskKind, Transition};

use super::{notify_on, settle};

/// Transfers a payout statement to the payee's connected account.
pub struct TransferPayoutHandler {
    gateway: Arc<dyn PaymentGateway>,
}

impl TransferPayoutHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TaskHandler for TransferPayoutHandler {
    type Entity = Statement;
    type Context = PayoutProfile;
    type Effect = Settlement;

    fn kind(&self) -> TaskKind {
        TaskKind::TransferPayout
    }

    async fn load(
        &self,
        tx: &mut dyn EntityStore,
        key: &TaskKey,
    ) -> Result<(Statement, PayoutProfile), ProtocolError> {
        Ok(load_payout_statement(tx, StatementId::from(key.subject_id)).await?)
    }

    async fn execute(
        &self,
        _key: &TaskKey,
        statement: &Statement,
        profile: &PayoutProfile,
        token: &IdempotencyToken,
    ) -> Result<Settlement, ExternalError> {
        let response = self
            .gateway
            .transfer(
                token,
                &profile.connected_account_id,
                statement.total,
                &statement.currency,
            )
            .await;
        Settlement::from_response(response)
    }

    fn apply_transition(
        &self,
        _key: &TaskKey,
        statement: &Statement,
        _profile: &PayoutProfile,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> Result<Transition<Statement>, ProtocolError> {
        let next = settle(statement, settlement, now)?;
        info!(
            statement_id = %next.statement_id,
            account_id = %next.account_id,
            state = next.state_label(),
            amount = next.total,
            "payout statement settled"
        );
        Ok(notify_on(next, now))
    }
}
