use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use payrail_billing::BillingProfile;
use payrail_core::{AccountId, VersionedEntity};

use crate::entity_store::{EntityStore, EntityStoreExt};
use crate::external::{ExternalError, PaymentGateway};
use crate::tasks::{IdempotencyToken, ProtocolError, Task, TaskHandler, TaskKey, TaskKind, Transition};

/// Links a billing profile to a newly created gateway customer.
///
/// Keyed by account only: the link happens once per profile, whatever its
/// version when the task runs.
pub struct CreateCustomerHandler {
    gateway: Arc<dyn PaymentGateway>,
}

impl CreateCustomerHandler {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TaskHandler for CreateCustomerHandler {
    type Entity = BillingProfile;
    type Context = ();
    type Effect = String;

    fn kind(&self) -> TaskKind {
        TaskKind::CreateCustomer
    }

    async fn load(
        &self,
        tx: &mut dyn EntityStore,
        key: &TaskKey,
    ) -> Result<(BillingProfile, ()), ProtocolError> {
        let profile: BillingProfile = tx.get(AccountId::from(key.subject_id)).await?;
        Ok((profile, ()))
    }

    fn is_stale(&self, _key: &TaskKey, profile: &BillingProfile) -> bool {
        profile.is_linked()
    }

    async fn execute(
        &self,
        _key: &TaskKey,
        profile: &BillingProfile,
        _context: &(),
        token: &IdempotencyToken,
    ) -> Result<String, ExternalError> {
        self.gateway
            .create_customer(token, profile.account_id, &profile.currency)
            .await
    }

    fn apply_transition(
        &self,
        _key: &TaskKey,
        profile: &BillingProfile,
        _context: &(),
        customer_id: String,
        now: DateTime<Utc>,
    ) -> Result<Transition<BillingProfile>, ProtocolError> {
        let linked = profile.link_customer(customer_id, now)?;
        let sync = Task::new(
            TaskKey::versioned(TaskKind::SyncBillingProfile, linked.account_id, linked.version()),
            now,
        );
        Ok(Transition::to(linked).schedule(sync))
    }
}
