//! In-memory profile store

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::{ContentRef, ProfileStore, UserProfile};
use crate::credits::SubscriptionTier;
use crate::error::{CreditError, CreditResult};

/// Profile store kept in a `DashMap`, for tests and ephemeral sessions
#[derive(Debug, Default, Clone)]
pub struct MemoryProfileStore {
    profiles: Arc<DashMap<String, UserProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_profile<T>(
        &self,
        uid: &str,
        f: impl FnOnce(&mut UserProfile) -> T,
    ) -> CreditResult<T> {
        let mut entry = self
            .profiles
            .get_mut(uid)
            .ok_or_else(|| CreditError::ProfileNotFound(uid.to_string()))?;
        Ok(f(entry.value_mut()))
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, uid: &str) -> CreditResult<Option<UserProfile>> {
        Ok(self.profiles.get(uid).map(|p| p.value().clone()))
    }

    fn create(&self, profile: &UserProfile) -> CreditResult<()> {
        self.profiles
            .entry(profile.uid.clone())
            .or_insert_with(|| profile.clone());
        Ok(())
    }

    fn update_login(&self, uid: &str, last_login: DateTime<Utc>, streak: u32) -> CreditResult<()> {
        self.with_profile(uid, |p| {
            p.last_login = last_login;
            p.login_streak = streak;
        })
    }

    fn set_tier(&self, uid: &str, tier: SubscriptionTier) -> CreditResult<()> {
        self.with_profile(uid, |p| p.tier = tier)
    }

    fn set_admin(&self, uid: &str, is_admin: bool) -> CreditResult<()> {
        self.with_profile(uid, |p| p.is_admin = is_admin)
    }

    fn set_display_name(&self, uid: &str, display_name: Option<&str>) -> CreditResult<()> {
        self.with_profile(uid, |p| p.display_name = display_name.map(str::to_string))
    }

    fn decrement_vault_credits(&self, uid: &str) -> CreditResult<Option<u32>> {
        self.with_profile(uid, |p| {
            if p.vault_credits == 0 {
                None
            } else {
                p.vault_credits -= 1;
                Some(p.vault_credits)
            }
        })
    }

    fn add_vault_credits(&self, uid: &str, amount: u32) -> CreditResult<u32> {
        self.with_profile(uid, |p| {
            p.vault_credits = p.vault_credits.saturating_add(amount);
            p.vault_credits
        })
    }

    fn add_content(&self, uid: &str, content: &ContentRef) -> CreditResult<()> {
        self.with_profile(uid, |p| p.content.insert(0, content.clone()))
    }
}
