//! Concrete task kinds.

pub mod charge_statement;
pub mod create_customer;
pub mod sync;
pub mod transfer_payout;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use payrail_billing::{BillingProfile, PayoutProfile, Statement};
use payrail_core::VersionedEntity;

use crate::datastore::Datastore;
use crate::external::{PaymentGateway, Settlement, SiblingService};
use crate::tasks::{Dispatcher, ProtocolError, Task, TaskKey, TaskKind, Transition};

pub use charge_statement::ChargeStatementHandler;
pub use create_customer::CreateCustomerHandler;
pub use sync::{NotifyStatementHandler, SyncProfileHandler, SyncedProfile};
pub use transfer_payout::TransferPayoutHandler;

/// Register a handler for every task kind.
pub fn register_all<D>(
    dispatcher: &mut Dispatcher<D>,
    gateway: Arc<dyn PaymentGateway>,
    sibling: Arc<dyn SiblingService>,
) where
    D: Datastore + 'static,
{
    dispatcher
        .register(CreateCustomerHandler::new(Arc::clone(&gateway)))
        .register(ChargeStatementHandler::new(Arc::clone(&gateway)))
        .register(TransferPayoutHandler::new(gateway))
        .register(SyncProfileHandler::<BillingProfile>::new(Arc::clone(&sibling)))
        .register(SyncProfileHandler::<PayoutProfile>::new(Arc::clone(&sibling)))
        .register(NotifyStatementHandler::new(sibling));
}

fn settle(statement: &Statement, settlement: Settlement, now: DateTime<Utc>) -> Result<Statement, ProtocolError> {
    let next = match settlement {
        Settlement::Settled { reference } => statement.mark_paid(reference, now)?,
        Settlement::Declined { reason } => statement.mark_failed(reason, now)?,
    };
    Ok(next)
}

/// Transition to `next`, reporting its new state to the sibling service.
fn notify_on(next: Statement, now: DateTime<Utc>) -> Transition<Statement> {
    let key = TaskKey::versioned(TaskKind::NotifyStatement, next.statement_id, next.version());
    Transition::to(next).schedule(Task::new(key, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Cascade;
    use payrail_billing::{StatementKind, StatementState};
    use payrail_core::{AccountId, Currency, LineItem, LineItemKind, StatementId};

    fn statement(now: DateTime<Utc>) -> Statement {
        Statement::open(
            StatementId::new(),
            AccountId::new(),
            StatementKind::Payout,
            Currency::new("USD").unwrap(),
            vec![LineItem::new(LineItemKind::Fee, 1, 1_500)],
            now,
        )
        .unwrap()
    }

    #[test]
    fn settlement_maps_to_paid_or_failed() {
        let now = Utc::now();
        let open = statement(now);

        let paid = settle(&open, Settlement::Settled { reference: "tr_1".into() }, now).unwrap();
        assert_eq!(paid.state(), StatementState::Paid);
        assert_eq!(paid.external_ref.as_deref(), Some("tr_1"));

        let failed = settle(&open, Settlement::Declined { reason: "closed".into() }, now).unwrap();
        assert_eq!(failed.state(), StatementState::Failed);
        assert_eq!(failed.version(), 2);
    }

    #[test]
    fn settling_twice_is_an_invalid_transition() {
        let now = Utc::now();
        let paid = settle(&statement(now), Settlement::Settled { reference: "tr_1".into() }, now).unwrap();

        match settle(&paid, Settlement::Settled { reference: "tr_2".into() }, now).unwrap_err() {
            ProtocolError::InvalidTransition(msg) if msg.contains("paid") => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn notification_is_keyed_to_the_new_version() {
        let now = Utc::now();
        let paid = settle(&statement(now), Settlement::Settled { reference: "tr_1".into() }, now).unwrap();
        let id = paid.statement_id;

        let transition = notify_on(paid, now);
        assert_eq!(
            transition.cascade,
            vec![Cascade::Schedule(Task::new(
                TaskKey::versioned(TaskKind::NotifyStatement, id, 2),
                now
            ))]
        );
    }
}
