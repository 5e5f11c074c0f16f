use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use payrail_core::{AccountId, Currency, DomainError, DomainResult, StateInfo, VersionedEntity};

/// Lifecycle of billing and payout profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileState {
    Healthy,
    Suspended,
}

impl ProfileState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileState::Healthy => "healthy",
            ProfileState::Suspended => "suspended",
        }
    }
}

/// Move `info` into `target`, or `None` when it is already there.
fn transition_to(
    info: &StateInfo<ProfileState>,
    target: ProfileState,
    now: DateTime<Utc>,
) -> Option<StateInfo<ProfileState>> {
    if info.state == target {
        None
    } else {
        Some(info.advance(target, now))
    }
}

fn check_reactivation(outstanding_failures: usize) -> DomainResult<()> {
    if outstanding_failures > 0 {
        return Err(DomainError::precondition(format!(
            "cannot reactivate profile with {outstanding_failures} failed statement(s) outstanding"
        )));
    }
    Ok(())
}

/// Customer-side profile: who we charge, in which currency, and from when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingProfile {
    pub account_id: AccountId,
    pub currency: Currency,
    /// First charge is never attempted before this instant.
    pub payment_after: DateTime<Utc>,
    /// Gateway customer id, set once by the linking transition.
    pub customer_id: Option<String>,
    pub state_info: StateInfo<ProfileState>,
    pub created_time: DateTime<Utc>,
}

impl BillingProfile {
    pub fn create(
        account_id: AccountId,
        currency: Currency,
        payment_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id,
            currency,
            payment_after,
            customer_id: None,
            state_info: StateInfo::initial(ProfileState::Healthy, now),
            created_time: now,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.customer_id.is_some()
    }

    /// One-time linking of the external customer record.
    pub fn link_customer(&self, customer_id: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        if self.is_linked() {
            return Err(DomainError::conflict("billing profile already linked to a customer"));
        }
        let customer_id = customer_id.into();
        if customer_id.is_empty() {
            return Err(DomainError::validation("customer id must not be empty"));
        }
        Ok(Self {
            customer_id: Some(customer_id),
            state_info: self.state_info.advance(self.state_info.state, now),
            ..self.clone()
        })
    }

    /// `None` when already suspended.
    pub fn suspend(&self, now: DateTime<Utc>) -> Option<Self> {
        transition_to(&self.state_info, ProfileState::Suspended, now).map(|state_info| Self {
            state_info,
            ..self.clone()
        })
    }

    /// `Ok(None)` when already healthy.
    pub fn reactivate(&self, outstanding_failures: usize, now: DateTime<Utc>) -> DomainResult<Option<Self>> {
        if self.state_info.state == ProfileState::Healthy {
            return Ok(None);
        }
        check_reactivation(outstanding_failures)?;
        Ok(transition_to(&self.state_info, ProfileState::Healthy, now).map(|state_info| Self {
            state_info,
            ..self.clone()
        }))
    }
}

impl VersionedEntity for BillingProfile {
    type Id = AccountId;
    type State = ProfileState;

    const ENTITY_TYPE: &'static str = "billing.profile";

    fn id(&self) -> Self::Id {
        self.account_id
    }

    fn owner_id(&self) -> Option<Uuid> {
        Some(*self.account_id.as_uuid())
    }

    fn state_info(&self) -> &StateInfo<Self::State> {
        &self.state_info
    }

    fn state_label(&self) -> &'static str {
        self.state_info.state.as_str()
    }
}

/// Payee-side profile: where payouts are transferred to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutProfile {
    pub account_id: AccountId,
    pub currency: Currency,
    /// Gateway connected-account id receiving transfers.
    pub connected_account_id: String,
    pub state_info: StateInfo<ProfileState>,
    pub created_time: DateTime<Utc>,
}

impl PayoutProfile {
    pub fn create(
        account_id: AccountId,
        currency: Currency,
        connected_account_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let connected_account_id = connected_account_id.into();
        if connected_account_id.is_empty() {
            return Err(DomainError::validation("connected account id must not be empty"));
        }
        Ok(Self {
            account_id,
            currency,
            connected_account_id,
            state_info: StateInfo::initial(ProfileState::Healthy, now),
            created_time: now,
        })
    }

    pub fn suspend(&self, now: DateTime<Utc>) -> Option<Self> {
        transition_to(&self.state_info, ProfileState::Suspended, now).map(|state_info| Self {
            state_info,
            ..self.clone()
        })
    }

    pub fn reactivate(&self, outstanding_failures: usize, now: DateTime<Utc>) -> DomainResult<Option<Self>> {
        if self.state_info.state == ProfileState::Healthy {
            return Ok(None);
        }
        check_reactivation(outstanding_failures)?;
        Ok(transition_to(&self.state_info, ProfileState::Healthy, now).map(|state_info| Self {
            state_info,
            ..self.clone()
        }))
    }
}

impl VersionedEntity for PayoutProfile {
    type Id = AccountId;
    type State = ProfileState;

    const ENTITY_TYPE: &'static str = "payout.profile";

    fn id(&self) -> Self::Id {
        self.account_id
    }

    fn owner_id(&self) -> Option<Uuid> {
        Some(*self.account_id.as_uuid())
    }

    fn state_info(&self) -> &StateInfo<Self::State> {
        &self.state_info
    }

    fn state_label(&self) -> &'static str {
        self.state_info.state.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    fn billing(now: DateTime<Utc>) -> BillingProfile {
        BillingProfile::create(AccountId::new(), usd(), now, now)
    }

    #[test]
    fn new_profile_starts_healthy_at_version_one() {
        let now = Utc::now();
        let profile = billing(now);
        assert_eq!(profile.version(), 1);
        assert_eq!(profile.state(), ProfileState::Healthy);
        assert!(!profile.is_linked());
    }

    #[test]
    fn linking_bumps_version_and_is_one_time() {
        let now = Utc::now();
        let profile = billing(now);
        let linked = profile.link_customer("cus_123", now).unwrap();
        assert_eq!(linked.version(), 2);
        assert_eq!(linked.customer_id.as_deref(), Some("cus_123"));
        assert_eq!(linked.state(), ProfileState::Healthy);

        let err = linked.link_customer("cus_456", now).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn suspending_twice_is_a_no_op() {
        let now = Utc::now();
        let suspended = billing(now).suspend(now).unwrap();
        assert_eq!(suspended.version(), 2);
        assert!(suspended.suspend(now + Duration::seconds(1)).is_none());
    }

    #[test]
    fn reactivation_requires_no_outstanding_failures() {
        let now = Utc::now();
        let suspended = billing(now).suspend(now).unwrap();

        let err = suspended.reactivate(2, now).unwrap_err();
        match err {
            DomainError::PreconditionFailed(msg) => assert!(msg.contains("2 failed statement")),
            other => panic!("expected PreconditionFailed, got {other:?}"),
        }

        let healthy = suspended.reactivate(0, now).unwrap().unwrap();
        assert_eq!(healthy.state(), ProfileState::Healthy);
        assert_eq!(healthy.version(), 3);
    }

    #[test]
    fn reactivating_a_healthy_profile_is_a_no_op_even_with_failures() {
        let now = Utc::now();
        assert!(billing(now).reactivate(5, now).unwrap().is_none());
    }

    #[test]
    fn payout_profile_requires_connected_account() {
        let now = Utc::now();
        assert!(PayoutProfile::create(AccountId::new(), usd(), "", now).is_err());
        let profile = PayoutProfile::create(AccountId::new(), usd(), "acct_1", now).unwrap();
        assert_eq!(profile.state_label(), "healthy");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: after N effective transitions the version is N + 1, and
        /// no two transitions produce the same version.
        #[test]
        fn version_tracks_effective_transitions(ops in prop::collection::vec(any::<bool>(), 0..40)) {
            let now = Utc::now();
            let mut profile = billing(now);
            let mut transitions = 0u64;
            let mut seen = vec![profile.version()];

            for suspend in ops {
                let next = if suspend {
                    profile.suspend(now)
                } else {
                    profile.reactivate(0, now).unwrap()
                };
                if let Some(next) = next {
                    transitions += 1;
                    prop_assert!(!seen.contains(&next.version()));
                    seen.push(next.version());
                    profile = next;
                }
            }

            prop_assert_eq!(profile.version(), transitions + 1);
        }
    }
}
