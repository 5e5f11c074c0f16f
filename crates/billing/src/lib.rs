//! Billing/payout domain module.
//!
//! Profiles and statements with their state machines, implemented purely as
//! deterministic domain logic (no IO, no storage). Every transition returns a
//! new value with the version bumped by exactly one; the task engine in
//! `payrail-infra` persists them.

pub mod profile;
pub mod statement;

pub use profile::{BillingProfile, PayoutProfile, ProfileState};
pub use statement::{Statement, StatementKind, StatementState};
