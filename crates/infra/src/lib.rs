//! Infrastructure layer: durable tasks, datastores, external collaborators
//! and the operations that tie them to the billing domain.

pub mod config;
pub mod datastore;
pub mod entity_store;
pub mod external;
pub mod kinds;
pub mod service;
pub mod tasks;

pub use config::{ConfigError, PayrailConfig};
pub use datastore::{Datastore, InMemoryDatastore, PostgresDatastore, StoreError, Transaction};
pub use service::{BillingService, ServiceError, ServiceResult};
