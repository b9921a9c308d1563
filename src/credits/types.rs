//! Credit data types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::CreditProtectionConfig;

/// Subscription tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    CreatorPro,
}

impl SubscriptionTier {
    /// Paid tiers are never metered
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::CreatorPro => "creator-pro",
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = TierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "premium" => Ok(Self::Premium),
            "creator-pro" | "creator_pro" | "creatorpro" | "pro" => Ok(Self::CreatorPro),
            _ => Err(TierParseError(s.to_string())),
        }
    }
}

/// Error parsing a tier string
#[derive(Debug, Clone)]
pub struct TierParseError(pub String);

impl std::fmt::Display for TierParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid tier: {}", self.0)
    }
}

impl std::error::Error for TierParseError {}

/// Remaining credits, either bounded or unlimited (paid tier or bypass)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Credits {
    Unlimited,
    Limited(u32),
}

impl Credits {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// The bounded count, or `None` when unlimited
    pub fn limited(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited(n) => Some(*n),
        }
    }

    pub fn covers(&self, amount: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(n) => *n >= amount,
        }
    }
}

impl std::fmt::Display for Credits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Limited(n) => write!(f, "{}", n),
        }
    }
}

/// Daily usage counters for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub daily_api_calls: u32,
    /// Estimated spend in USD since the last reset
    pub total_spend: f64,
    pub last_reset: NaiveDate,
}

impl UsageStats {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_api_calls: 0,
            total_spend: 0.0,
            last_reset: today,
        }
    }

    /// Whether the calendar date has rolled over since the last reset
    pub fn is_stale(&self, today: NaiveDate) -> bool {
        self.last_reset != today
    }
}

/// Why the emergency lockout is engaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lockout {
    /// Usage ratio crossed the emergency threshold
    Threshold,
    /// High-cost features were disabled explicitly
    Forced,
}

impl Lockout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Forced => "forced",
        }
    }
}

impl std::str::FromStr for Lockout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(Self::Threshold),
            "forced" => Ok(Self::Forced),
            other => Err(format!("unknown lockout: {}", other)),
        }
    }
}

/// Persisted per-user state for one day: counters plus the latches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayState {
    pub stats: UsageStats,
    pub lockout: Option<Lockout>,
    pub admin_alerted: bool,
}

impl DayState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            stats: UsageStats::new(today),
            lockout: None,
            admin_alerted: false,
        }
    }
}

/// Protection state machine level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionLevel {
    #[default]
    Normal,
    Warning,
    Emergency,
}

/// Which quota an action draws from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum Meter {
    /// Daily call counter, with the estimated cost of one call
    #[serde(rename = "dailyCalls")]
    DailyCalls { cost: f64 },
    /// Persisted vault-credit balance
    #[serde(rename = "vaultCredits")]
    VaultCredits,
}

impl Meter {
    /// Daily-call meter at the configured per-call cost
    pub fn daily(config: &CreditProtectionConfig) -> Self {
        Self::DailyCalls {
            cost: config.default_action_cost,
        }
    }
}

/// Result of a credit check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum CreditCheck {
    #[serde(rename = "allowed")]
    Allowed { remaining: Credits },
    #[serde(rename = "denied")]
    Denied { reason: DenialReason },
}

impl CreditCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn denial_reason(&self) -> Option<&DenialReason> {
        match self {
            Self::Denied { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Reason for denying a metered action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type")]
pub enum DenialReason {
    #[serde(rename = "dailyLimitExceeded")]
    DailyLimitExceeded { limit: u32, used: u32 },
    /// Emergency lockout is active
    #[serde(rename = "emergencyLockout")]
    EmergencyLockout { limit: u32, used: u32 },
    #[serde(rename = "vaultEmpty")]
    VaultEmpty,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLimitExceeded { limit, used } => write!(
                f,
                "Daily free limit reached: {}/{} generations used. Upgrade or come back tomorrow.",
                used, limit
            ),
            Self::EmergencyLockout { limit, used } => write!(
                f,
                "Generation is paused to protect your credits ({}/{} used today). Upgrade for unlimited access.",
                used, limit
            ),
            Self::VaultEmpty => write!(f, "Your vault is out of credits. Upgrade to keep creating."),
        }
    }
}

/// Derived view over both quota mechanisms for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub tier: SubscriptionTier,
    pub bypass: bool,
    pub level: ProtectionLevel,
    pub daily_api_calls: u32,
    pub daily_limit: u32,
    pub total_spend: f64,
    pub calls_remaining: Credits,
    pub usage_percentage: f64,
    pub balance_remaining: Credits,
    pub vault_locked: bool,
}
