//! Core task types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task kind, used both for routing to a handler and as part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Create the gateway customer record for a billing profile.
    CreateCustomer,
    /// Charge a billing statement against the linked customer.
    ChargeStatement,
    /// Transfer a payout statement to the connected account.
    TransferPayout,
    /// Report billing profile state to the sibling service.
    SyncBillingProfile,
    /// Report payout profile state to the sibling service.
    SyncPayoutProfile,
    /// Report statement state to the sibling service.
    NotifyStatement,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::CreateCustomer,
        TaskKind::ChargeStatement,
        TaskKind::TransferPayout,
        TaskKind::SyncBillingProfile,
        TaskKind::SyncPayoutProfile,
        TaskKind::NotifyStatement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::CreateCustomer => "create_customer",
            TaskKind::ChargeStatement => "charge_statement",
            TaskKind::TransferPayout => "transfer_payout",
            TaskKind::SyncBillingProfile => "sync_billing_profile",
            TaskKind::SyncPayoutProfile => "sync_payout_profile",
            TaskKind::NotifyStatement => "notify_statement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural primary key of a task.
///
/// `version` is set for tasks that act on one specific entity version and is
/// `None` for tasks keyed by subject alone (e.g. one-time linking).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub subject_id: Uuid,
    pub version: Option<u64>,
}

impl TaskKey {
    pub fn new(kind: TaskKind, subject_id: impl Into<Uuid>) -> Self {
        Self {
            kind,
            subject_id: subject_id.into(),
            version: None,
        }
    }

    pub fn versioned(kind: TaskKind, subject_id: impl Into<Uuid>, version: u64) -> Self {
        Self {
            kind,
            subject_id: subject_id.into(),
            version: Some(version),
        }
    }

    /// Deterministic token for the external call this task performs.
    ///
    /// Built only from the key, so every attempt of the same logical unit of
    /// work presents the same token.
    pub fn idempotency_token(&self) -> IdempotencyToken {
        let token = match self.version {
            Some(v) => format!("{}:{}:v{}", self.kind, self.subject_id, v),
            None => format!("{}:{}", self.kind, self.subject_id),
        };
        IdempotencyToken(token)
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}/{}@v{}", self.kind, self.subject_id, v),
            None => write!(f, "{}/{}", self.kind, self.subject_id),
        }
    }
}

/// Idempotency key handed to external systems.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable part of a task row, as read and written by the claim step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Times the task has been claimed.
    pub retry_count: u32,
    /// Eligible for claiming iff `execution_time <= now`.
    pub execution_time: DateTime<Utc>,
    /// Immutable; used for max-age checks.
    pub created_time: DateTime<Utc>,
}

/// A unit of deferred, retryable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub retry_count: u32,
    pub execution_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
}

impl Task {
    /// A task that is due immediately.
    pub fn new(key: TaskKey, now: DateTime<Utc>) -> Self {
        Self::scheduled_at(key, now, now)
    }

    /// A task that becomes due at `at` (never earlier than `now`).
    pub fn scheduled_at(key: TaskKey, at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            retry_count: 0,
            execution_time: at.max(now),
            created_time: now,
        }
    }

    pub fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            retry_count: self.retry_count,
            execution_time: self.execution_time,
            created_time: self.created_time,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execution_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn kind_names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskKind::parse("bogus"), None);
    }

    #[test]
    fn token_is_stable_and_version_scoped() {
        let subject = Uuid::now_v7();
        let a = TaskKey::versioned(TaskKind::ChargeStatement, subject, 1);
        let b = TaskKey::versioned(TaskKind::ChargeStatement, subject, 1);
        let c = TaskKey::versioned(TaskKind::ChargeStatement, subject, 3);

        assert_eq!(a.idempotency_token(), b.idempotency_token());
        assert_ne!(a.idempotency_token(), c.idempotency_token());
        assert_eq!(
            TaskKey::new(TaskKind::CreateCustomer, subject).idempotency_token().as_str(),
            format!("create_customer:{subject}")
        );
    }

    #[test]
    fn scheduling_in_the_past_means_now() {
        let now = Utc::now();
        let key = TaskKey::new(TaskKind::CreateCustomer, Uuid::now_v7());

        let past = Task::scheduled_at(key, now - Duration::hours(1), now);
        assert_eq!(past.execution_time, now);
        assert!(past.is_due(now));

        let future = Task::scheduled_at(key, now + Duration::hours(1), now);
        assert!(!future.is_due(now));
        assert_eq!(future.created_time, now);
        assert_eq!(future.retry_count, 0);
    }
}
