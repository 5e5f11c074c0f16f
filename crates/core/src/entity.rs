//! Versioned entities: identity plus a monotonic, version-stamped state.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// Version-stamped state of an entity.
///
/// `version` starts at 1 on creation and grows by exactly 1 per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInfo<S> {
    pub version: u64,
    pub state: S,
    pub updated_time: DateTime<Utc>,
}

impl<S: Copy> StateInfo<S> {
    /// State of a freshly created entity.
    pub fn initial(state: S, now: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            state,
            updated_time: now,
        }
    }

    /// The state info after one transition into `state`.
    pub fn advance(&self, state: S, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version + 1,
            state,
            updated_time: now,
        }
    }
}

/// Entity whose every state transition bumps a version.
///
/// Entities are persisted as opaque JSON bodies plus a few indexed columns
/// (`ENTITY_TYPE`, id, owner, version, state label).
pub trait VersionedEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Strongly-typed entity identifier.
    type Id: Copy
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + core::fmt::Display
        + Into<Uuid>
        + From<Uuid>
        + Send
        + Sync;

    /// Closed set of lifecycle states.
    type State: Copy + Eq + core::fmt::Debug + Send + Sync;

    /// Stable type discriminator used as part of the storage key.
    const ENTITY_TYPE: &'static str;

    fn id(&self) -> Self::Id;

    /// Owning entity (e.g. the account a statement belongs to), if any.
    fn owner_id(&self) -> Option<Uuid> {
        None
    }

    fn state_info(&self) -> &StateInfo<Self::State>;

    /// Stable, lowercase name of the current state (indexed column).
    fn state_label(&self) -> &'static str;

    fn version(&self) -> u64 {
        self.state_info().version
    }

    fn state(&self) -> Self::State {
        self.state_info().state
    }
}

/// Optimistic concurrency expectation for an entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the entity to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
