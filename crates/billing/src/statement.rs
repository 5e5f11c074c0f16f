use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use payrail_core::{
    AccountId, Currency, DomainError, DomainResult, LineItem, StateInfo, StatementId, VersionedEntity,
};

/// Money direction of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// We charge the account's billing profile.
    Billing,
    /// We transfer funds to the account's payout profile.
    Payout,
}

/// Statement lifecycle.
///
/// `Processing → Paid | Failed`; `Failed → Processing` only through an
/// explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementState {
    Processing,
    Paid,
    Failed,
}

impl StatementState {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementState::Processing => "processing",
            StatementState::Paid => "paid",
            StatementState::Failed => "failed",
        }
    }
}

/// A priced set of line items to be settled against the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub statement_id: StatementId,
    pub account_id: AccountId,
    pub kind: StatementKind,
    pub currency: Currency,
    pub line_items: Vec<LineItem>,
    /// Exact sum of `line_items` amounts, in minor units.
    pub total: i64,
    /// Gateway charge/transfer reference once paid.
    pub external_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub state_info: StateInfo<StatementState>,
    pub created_time: DateTime<Utc>,
}

impl Statement {
    pub fn open(
        statement_id: StatementId,
        account_id: AccountId,
        kind: StatementKind,
        currency: Currency,
        line_items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if line_items.is_empty() {
            return Err(DomainError::validation("statement must have at least one line item"));
        }
        let total = LineItem::total(&line_items)?;
        if total <= 0 {
            return Err(DomainError::validation(format!(
                "statement total must be positive, got {total}"
            )));
        }

        Ok(Self {
            statement_id,
            account_id,
            kind,
            currency,
            line_items,
            total,
            external_ref: None,
            failure_reason: None,
            state_info: StateInfo::initial(StatementState::Processing, now),
            created_time: now,
        })
    }

    fn ensure_processing(&self) -> DomainResult<()> {
        if self.state_info.state != StatementState::Processing {
            return Err(DomainError::invariant(format!(
                "statement is {}, expected processing",
                self.state_info.state.as_str()
            )));
        }
        Ok(())
    }

    /// Record a confirmed charge/transfer.
    pub fn mark_paid(&self, external_ref: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        self.ensure_processing()?;
        Ok(Self {
            external_ref: Some(external_ref.into()),
            failure_reason: None,
            state_info: self.state_info.advance(StatementState::Paid, now),
            ..self.clone()
        })
    }

    /// Record a definitive decline from the gateway.
    pub fn mark_failed(&self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        self.ensure_processing()?;
        Ok(Self {
            failure_reason: Some(reason.into()),
            state_info: self.state_info.advance(StatementState::Failed, now),
            ..self.clone()
        })
    }

    /// Explicit retry of a failed statement.
    pub fn retry(&self, now: DateTime<Utc>) -> DomainResult<Self> {
        if self.state_info.state != StatementState::Failed {
            return Err(DomainError::precondition(format!(
                "only failed statements can be retried (statement is {})",
                self.state_info.state.as_str()
            )));
        }
        Ok(Self {
            failure_reason: None,
            state_info: self.state_info.advance(StatementState::Processing, now),
            ..self.clone()
        })
    }
}

impl VersionedEntity for Statement {
    type Id = StatementId;
    type State = StatementState;

    const ENTITY_TYPE: &'static str = "statement";

    fn id(&self) -> Self::Id {
        self.statement_id
    }

    fn owner_id(&self) -> Option<Uuid> {
        Some(*self.account_id.as_uuid())
    }

    fn state_info(&self) -> &StateInfo<Self::State> {
        &self.state_info
    }

    fn state_label(&self) -> &'static str {
        self.state_info.state.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrail_core::LineItemKind;

    fn items() -> Vec<LineItem> {
        vec![
            LineItem::new(LineItemKind::Subscription, 1, 2_000),
            LineItem::new(LineItemKind::Usage, 120, 360),
        ]
    }

    fn open(now: DateTime<Utc>) -> Statement {
        Statement::open(
            StatementId::new(),
            AccountId::new(),
            StatementKind::Billing,
            Currency::new("EUR").unwrap(),
            items(),
            now,
        )
        .unwrap()
    }

    #[test]
    fn total_is_sum_of_line_item_amounts() {
        let statement = open(Utc::now());
        assert_eq!(statement.total, 2_360);
        assert_eq!(statement.state(), StatementState::Processing);
        assert_eq!(statement.version(), 1);
    }

    #[test]
    fn empty_or_non_positive_statements_are_rejected() {
        let now = Utc::now();
        let currency = Currency::new("EUR").unwrap();
        let err = Statement::open(
            StatementId::new(),
            AccountId::new(),
            StatementKind::Payout,
            currency.clone(),
            vec![],
            now,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = Statement::open(
            StatementId::new(),
            AccountId::new(),
            StatementKind::Payout,
            currency,
            vec![LineItem::new(LineItemKind::Adjustment, 1, -5)],
            now,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn paid_is_terminal_for_further_settlement() {
        let now = Utc::now();
        let paid = open(now).mark_paid("ch_1", now).unwrap();
        assert_eq!(paid.state(), StatementState::Paid);
        assert_eq!(paid.version(), 2);
        assert!(paid.mark_paid("ch_2", now).is_err());
        assert!(paid.mark_failed("declined", now).is_err());
        assert!(matches!(paid.retry(now), Err(DomainError::PreconditionFailed(_))));
    }

    #[test]
    fn failed_statement_can_be_retried_then_paid() {
        let now = Utc::now();
        let failed = open(now).mark_failed("card_declined", now).unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("card_declined"));

        let retried = failed.retry(now).unwrap();
        assert_eq!(retried.state(), StatementState::Processing);
        assert_eq!(retried.version(), 3);
        assert!(retried.failure_reason.is_none());

        let paid = retried.mark_paid("ch_9", now).unwrap();
        assert_eq!(paid.version(), 4);
        assert_eq!(paid.external_ref.as_deref(), Some("ch_9"));
    }

    #[test]
    fn statement_serializes_state_in_lowercase() {
        let statement = open(Utc::now());
        let json = serde_json::to_value(&statement).unwrap();
        assert_eq!(json["state_info"]["state"], "processing");
        assert_eq!(json["kind"], "billing");
    }
}
