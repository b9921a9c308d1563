//! Vault-credit quota
//!
//! The second gate, keyed on the persisted `vault_credits` balance of a
//! profile. Free-tier users spend one credit per action; paid tiers and the
//! bypass flag are never locked and never decremented.

use tracing::{debug, error, warn};

use super::bypass::BypassFlag;
use super::types::{CreditCheck, Credits, DenialReason};
use crate::error::{CreditError, CreditResult};
use crate::profile::{ProfileStore, UserProfile};

#[derive(Debug, Clone, Default)]
pub struct VaultQuota {
    bypass: BypassFlag,
}

impl VaultQuota {
    pub fn new(bypass: BypassFlag) -> Self {
        Self { bypass }
    }

    fn is_unmetered(&self, profile: &UserProfile) -> bool {
        self.bypass.is_active() || profile.tier.is_paid()
    }

    /// Free tier with an empty balance
    pub fn is_locked(&self, profile: &UserProfile) -> bool {
        !self.is_unmetered(profile) && profile.vault_credits == 0
    }

    /// Balance as shown to the user
    pub fn balance(&self, profile: &UserProfile) -> Credits {
        if self.is_unmetered(profile) {
            Credits::Unlimited
        } else {
            Credits::Limited(profile.vault_credits)
        }
    }

    pub fn check(&self, profile: &UserProfile, amount: u32) -> CreditCheck {
        let remaining = self.balance(profile);
        if remaining.covers(amount.max(1)) {
            CreditCheck::Allowed { remaining }
        } else {
            CreditCheck::Denied {
                reason: DenialReason::VaultEmpty,
            }
        }
    }

    /// Take `amount` credits from the stored balance
    ///
    /// Each credit is a conditional decrement in the store. If the balance
    /// runs out partway, the credits already taken are put back and the
    /// call fails with [`DenialReason::VaultEmpty`]. Returns the balance
    /// confirmed by the store. An action always costs at least one credit,
    /// so `amount` 0 is charged as 1.
    pub fn consume(
        &self,
        store: &dyn ProfileStore,
        profile: &UserProfile,
        amount: u32,
    ) -> CreditResult<Credits> {
        if self.is_unmetered(profile) {
            return Ok(Credits::Unlimited);
        }

        let amount = amount.max(1);
        let mut balance = profile.vault_credits;
        for taken in 0..amount {
            match store.decrement_vault_credits(&profile.uid) {
                Ok(Some(left)) => balance = left,
                Ok(None) => {
                    if taken > 0 {
                        self.refund(store, profile, taken)?;
                    }
                    warn!(uid = %profile.uid, amount, "Vault credits exhausted");
                    return Err(CreditError::QuotaExceeded(DenialReason::VaultEmpty));
                }
                Err(e) => {
                    error!(uid = %profile.uid, error = %e, "Failed to decrement vault credits");
                    return Err(e);
                }
            }
        }

        debug!(uid = %profile.uid, amount, balance, "Consumed vault credits");
        Ok(Credits::Limited(balance))
    }

    /// Put `amount` credits back after a failed action
    pub fn refund(
        &self,
        store: &dyn ProfileStore,
        profile: &UserProfile,
        amount: u32,
    ) -> CreditResult<Credits> {
        if self.is_unmetered(profile) || amount == 0 {
            return Ok(self.balance(profile));
        }
        let balance = store
            .add_vault_credits(&profile.uid, amount)
            .inspect_err(|e| {
                error!(uid = %profile.uid, error = %e, "Failed to refund vault credits")
            })?;
        debug!(uid = %profile.uid, amount, balance, "Refunded vault credits");
        Ok(Credits::Limited(balance))
    }
}
