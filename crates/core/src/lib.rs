//! `payrail-core`: foundation building blocks shared by the billing domain
//! and the task engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, versioned entity state, money, and the injected `Clock` /
//! `IdGenerator` capabilities.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;

pub use clock::{Clock, IdGenerator, ManualClock, SequentialIdGenerator, SystemClock, UuidV7Generator};
pub use entity::{ExpectedVersion, StateInfo, VersionedEntity};
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, StatementId};
pub use money::{Currency, LineItem, LineItemKind};
