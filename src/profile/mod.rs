//! User profiles
//!
//! The profile document owns the subscription tier, the vault-credit balance
//! and references to generated content. Stores are synchronous; callers
//! serialize access per user.

mod memory;
mod sqlite;

pub use memory::MemoryProfileStore;
pub use sqlite::SqliteProfileStore;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credits::SubscriptionTier;
use crate::error::CreditResult;

/// Kind of generated content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Writing,
    Art,
    Voice,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Writing => "writing",
            Self::Art => "art",
            Self::Voice => "voice",
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "writing" => Ok(Self::Writing),
            "art" => Ok(Self::Art),
            "voice" => Ok(Self::Voice),
            other => Err(format!("unknown content kind: {}", other)),
        }
    }
}

/// Reference to a piece of content owned by a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub id: Uuid,
    pub kind: ContentKind,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl ContentRef {
    pub fn new(kind: ContentKind, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub tier: SubscriptionTier,
    pub vault_credits: u32,
    pub login_streak: u32,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
    /// Newest first
    pub content: Vec<ContentRef>,
}

impl UserProfile {
    /// Free-tier defaults for a first sign-in
    pub fn new(
        uid: impl Into<String>,
        email: impl Into<String>,
        vault_credits: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: uid.into(),
            email: email.into(),
            display_name: None,
            tier: SubscriptionTier::Free,
            vault_credits,
            login_streak: 1,
            is_admin: false,
            created_at: now,
            last_login: now,
            content: Vec::new(),
        }
    }
}

/// Login streak after signing in on `today`, given the previous login day
pub fn next_login_streak(current: u32, last_login_day: NaiveDate, today: NaiveDate) -> u32 {
    match (today - last_login_day).num_days() {
        0 => current.max(1),
        1 => current.saturating_add(1),
        _ => 1,
    }
}

/// Backing document store for profiles
pub trait ProfileStore: Send + Sync {
    fn get(&self, uid: &str) -> CreditResult<Option<UserProfile>>;

    /// Insert a new profile; an existing profile with the same uid is kept
    fn create(&self, profile: &UserProfile) -> CreditResult<()>;

    fn update_login(&self, uid: &str, last_login: DateTime<Utc>, streak: u32) -> CreditResult<()>;

    fn set_tier(&self, uid: &str, tier: SubscriptionTier) -> CreditResult<()>;

    fn set_admin(&self, uid: &str, is_admin: bool) -> CreditResult<()>;

    fn set_display_name(&self, uid: &str, display_name: Option<&str>) -> CreditResult<()>;

    /// Take one vault credit
    ///
    /// Returns the new balance, or `None` when the balance was already zero.
    fn decrement_vault_credits(&self, uid: &str) -> CreditResult<Option<u32>>;

    /// Add credits (grants and refunds), returning the new balance
    fn add_vault_credits(&self, uid: &str, amount: u32) -> CreditResult<u32>;

    fn add_content(&self, uid: &str, content: &ContentRef) -> CreditResult<()>;
}
