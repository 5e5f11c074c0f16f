//! Outbound collaborators: the payment gateway and the sibling service that
//! mirrors profile and statement state.
//!
//! Every call carries an `IdempotencyToken`; implementations must return the
//! same result for the same token without repeating the side effect.

pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

use payrail_core::{AccountId, Currency, StatementId};

use crate::tasks::IdempotencyToken;

pub use fake::{FakeGateway, GatewayEffect, RecordingSibling, SiblingReport};

/// Failure reported by an external system.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    /// Definitive business refusal (card declined, transfer refused).
    #[error("declined: {0}")]
    Declined(String),

    /// Transport failure or timeout; the call may or may not have landed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Request was malformed or not acceptable in the current state.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Result of a money-moving call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled { reference: String },
    Declined { reason: String },
}

impl Settlement {
    /// Fold a gateway response into a settlement; only a decline is a
    /// definitive outcome, anything else stays an error to be retried.
    pub fn from_response(response: Result<String, ExternalError>) -> Result<Self, ExternalError> {
        match response {
            Ok(reference) => Ok(Settlement::Settled { reference }),
            Err(ExternalError::Declined(reason)) => Ok(Settlement::Declined { reason }),
            Err(other) => Err(other),
        }
    }
}

/// Payment gateway (customers, charges, transfers).
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create the customer record; returns the gateway customer id.
    async fn create_customer(
        &self,
        token: &IdempotencyToken,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<String, ExternalError>;

    /// Charge a customer; returns the charge reference.
    async fn charge(
        &self,
        token: &IdempotencyToken,
        customer_id: &str,
        amount: i64,
        currency: &Currency,
    ) -> Result<String, ExternalError>;

    /// Transfer funds to a connected account; returns the transfer reference.
    async fn transfer(
        &self,
        token: &IdempotencyToken,
        connected_account_id: &str,
        amount: i64,
        currency: &Currency,
    ) -> Result<String, ExternalError>;
}

/// Sibling service that is kept informed of state changes.
#[async_trait]
pub trait SiblingService: Send + Sync {
    async fn report_profile_state(
        &self,
        token: &IdempotencyToken,
        profile_type: &str,
        account_id: AccountId,
        state: &str,
        version: u64,
    ) -> Result<(), ExternalError>;

    async fn report_statement_state(
        &self,
        token: &IdempotencyToken,
        statement_id: StatementId,
        account_id: AccountId,
        state: &str,
        version: u64,
    ) -> Result<(), ExternalError>;
}

