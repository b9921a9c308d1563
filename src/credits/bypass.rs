//! Admin bypass ("God Mode")
//!
//! The flag is an explicit handle passed to whoever needs it. Clones share
//! state, so toggling it is seen immediately by every policy holding a clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CreditError, CreditResult};
use crate::profile::UserProfile;
use crate::storage::LocalStorage;

/// Local storage key for the persisted flag
pub const GOD_MODE_KEY: &str = "godMode";

#[derive(Debug, Clone, Default)]
pub struct BypassFlag(Arc<AtomicBool>);

impl BypassFlag {
    pub fn new(active: bool) -> Self {
        Self(Arc::new(AtomicBool::new(active)))
    }

    /// Read the persisted flag; anything but `"true"` means off
    ///
    /// An unreadable or malformed storage file also means off.
    pub fn load(storage: &LocalStorage) -> Self {
        let active = match storage.get(GOD_MODE_KEY) {
            Ok(value) => value.as_deref() == Some("true"),
            Err(e) => {
                warn!(path = ?storage.path(), error = %e, "Unreadable local storage, bypass off");
                false
            }
        };
        if active {
            info!("Bypass flag loaded as active");
        }
        Self::new(active)
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set in memory only
    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }

    /// Toggle on behalf of `profile` and persist the new value
    pub fn toggle(
        &self,
        profile: &UserProfile,
        active: bool,
        storage: &LocalStorage,
    ) -> CreditResult<()> {
        if !profile.is_admin {
            warn!(uid = %profile.uid, "Non-admin tried to toggle bypass");
            return Err(CreditError::NotAdmin(profile.uid.clone()));
        }
        storage.set(GOD_MODE_KEY, if active { "true" } else { "false" })?;
        self.set(active);
        info!(uid = %profile.uid, active, "Bypass flag toggled");
        Ok(())
    }
}
