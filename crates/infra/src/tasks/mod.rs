//! Durable task queue and its execution protocol.
//!
//! Tasks are rows keyed by `(kind, subject, version)` with a visibility time
//! (`execution_time`) and a retry counter. The dispatcher claims due tasks
//! (leasing them by pushing visibility out by the backoff delay) and runs the
//! matching `TaskHandler` through `TaskProtocol::process`.

pub mod backoff;
pub mod dispatcher;
pub mod protocol;
pub mod store;
pub mod types;

pub use backoff::BackoffPolicy;
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use protocol::{
    Cascade, Claim, ProcessOutcome, ProtocolError, TaskHandler, TaskProtocol, Transition, apply_cascade,
};
pub use store::TaskStore;
pub use types::{IdempotencyToken, Task, TaskKey, TaskKind, TaskMetadata};
