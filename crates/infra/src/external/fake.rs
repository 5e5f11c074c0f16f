//! In-memory collaborators for tests and local runs.
//!
//! Both fakes honour the idempotency contract: a token that already produced
//! a result returns it again without a second side effect.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use payrail_core::{AccountId, Currency, StatementId};

use crate::tasks::IdempotencyToken;

use super::{ExternalError, PaymentGateway, SiblingService};

#[derive(Debug, Clone)]
enum Scripted {
    /// Fail before anything happens.
    Fail(ExternalError),
    /// Definitive refusal, remembered for the token.
    Decline(String),
    /// Perform the effect, then fail as if the response was lost.
    LoseResponse,
}

/// A side effect the fake gateway actually performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEffect {
    pub operation: &'static str,
    pub token: String,
    pub target: String,
    pub amount: i64,
    pub reference: String,
}

#[derive(Debug, Default)]
struct GatewayState {
    attempts: usize,
    results: HashMap<String, Result<String, ExternalError>>,
    effects: Vec<GatewayEffect>,
    script: VecDeque<Scripted>,
}

/// Scriptable in-memory payment gateway.
#[derive(Debug, Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next uncached call fail without an effect.
    pub async fn fail_next(&self, err: ExternalError) {
        self.state.lock().await.script.push_back(Scripted::Fail(err));
    }

    /// Make the next uncached call a definitive decline.
    pub async fn decline_next(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .script
            .push_back(Scripted::Decline(reason.into()));
    }

    /// Make the next uncached call succeed remotely but report `Unavailable`.
    pub async fn lose_next_response(&self) {
        self.state.lock().await.script.push_back(Scripted::LoseResponse);
    }

    /// Calls received, including replays and failures.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }

    pub async fn effects(&self) -> Vec<GatewayEffect> {
        self.state.lock().await.effects.clone()
    }

    async fn call(
        &self,
        operation: &'static str,
        prefix: &str,
        token: &IdempotencyToken,
        target: String,
        amount: i64,
    ) -> Result<String, ExternalError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;

        if let Some(cached) = state.results.get(token.as_str()) {
            return cached.clone();
        }

        let lose_response = match state.script.pop_front() {
            Some(Scripted::Fail(err)) => return Err(err),
            Some(Scripted::Decline(reason)) => {
                let result = Err(ExternalError::Declined(reason));
                state.results.insert(token.as_str().to_string(), result.clone());
                return result;
            }
            Some(Scripted::LoseResponse) => true,
            None => false,
        };

        let reference = format!("{prefix}_{:04}", state.effects.len() + 1);
        state.effects.push(GatewayEffect {
            operation,
            token: token.as_str().to_string(),
            target,
            amount,
            reference: reference.clone(),
        });
        state
            .results
            .insert(token.as_str().to_string(), Ok(reference.clone()));

        if lose_response {
            return Err(ExternalError::Unavailable(format!("{operation}: response lost")));
        }
        Ok(reference)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(
        &self,
        token: &IdempotencyToken,
        account_id: AccountId,
        _currency: &Currency,
    ) -> Result<String, ExternalError> {
        self.call("create_customer", "cus", token, account_id.to_string(), 0)
            .await
    }

    async fn charge(
        &self,
        token: &IdempotencyToken,
        customer_id: &str,
        amount: i64,
        _currency: &Currency,
    ) -> Result<String, ExternalError> {
        if amount <= 0 {
            return Err(ExternalError::Rejected(format!("charge amount must be positive, got {amount}")));
        }
        self.call("charge", "ch", token, customer_id.to_string(), amount)
            .await
    }

    async fn transfer(
        &self,
        token: &IdempotencyToken,
        connected_account_id: &str,
        amount: i64,
        _currency: &Currency,
    ) -> Result<String, ExternalError> {
        if amount <= 0 {
            return Err(ExternalError::Rejected(format!("transfer amount must be positive, got {amount}")));
        }
        self.call("transfer", "tr", token, connected_account_id.to_string(), amount)
            .await
    }
}

/// One state report received by `RecordingSibling`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingReport {
    pub token: String,
    /// `billing.profile`, `payout.profile` or `statement`.
    pub subject_type: String,
    pub subject_id: Uuid,
    pub state: String,
    pub version: u64,
}

#[derive(Debug, Default)]
struct SiblingState {
    reports: Vec<SiblingReport>,
    failures: VecDeque<ExternalError>,
}

/// Sibling service that records reports, deduplicated by token.
#[derive(Debug, Default)]
pub struct RecordingSibling {
    state: Mutex<SiblingState>,
}

impl RecordingSibling {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next(&self, err: ExternalError) {
        self.state.lock().await.failures.push_back(err);
    }

    pub async fn reports(&self) -> Vec<SiblingReport> {
        self.state.lock().await.reports.clone()
    }

    async fn record(&self, token: &IdempotencyToken, report: SiblingReport) -> Result<(), ExternalError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if state.reports.iter().any(|r| r.token == token.as_str()) {
            return Ok(());
        }
        state.reports.push(report);
        Ok(())
    }
}

#[async_trait]
impl SiblingService for RecordingSibling {
    async fn report_profile_state(
        &self,
        token: &IdempotencyToken,
        profile_type: &str,
        account_id: AccountId,
        state: &str,
        version: u64,
    ) -> Result<(), ExternalError> {
        let report = SiblingReport {
            token: token.as_str().to_string(),
            subject_type: profile_type.to_string(),
            subject_id: account_id.into(),
            state: state.to_string(),
            version,
        };
        self.record(token, report).await
    }

    async fn report_statement_state(
        &self,
        token: &IdempotencyToken,
        statement_id: StatementId,
        _account_id: AccountId,
        state: &str,
        version: u64,
    ) -> Result<(), ExternalError> {
        let report = SiblingReport {
            token: token.as_str().to_string(),
            subject_type: "statement".to_string(),
            subject_id: statement_id.into(),
            state: state.to_string(),
            version,
        };
        self.record(token, report).await
    }
}
