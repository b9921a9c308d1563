//! Usage banners for the front end
//!
//! Turns a [`QuotaSnapshot`] into the warning or lockout banner shown above
//! the creation tools, together with the usage bar it renders.

use serde::{Deserialize, Serialize};

use crate::credits::{Credits, DenialReason, ProtectionLevel, QuotaSnapshot};

/// Vault balance at or below which a heads-up banner is shown
const LOW_VAULT_BALANCE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBar {
    /// Fill in `[0, 100]`
    pub percent: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Banner {
    pub severity: BannerSeverity,
    pub title: String,
    pub message: String,
    pub show_upgrade: bool,
    pub bar: UsageBar,
}

impl Banner {
    /// Banner for the current quota state, or `None` when nothing needs saying
    pub fn from_snapshot(snapshot: &QuotaSnapshot) -> Option<Self> {
        if snapshot.bypass || snapshot.tier.is_paid() {
            return None;
        }

        let used = snapshot.daily_api_calls;
        let limit = snapshot.daily_limit;
        let bar = UsageBar {
            percent: snapshot.usage_percentage.clamp(0.0, 100.0),
            label: format!("{}/{} free generations today", used.min(limit), limit),
        };

        if snapshot.vault_locked {
            return Some(Self::critical(
                "Vault empty",
                DenialReason::VaultEmpty.to_string(),
                bar,
            ));
        }

        if snapshot.calls_remaining == Credits::Limited(0) {
            return Some(Self::critical(
                "Daily limit reached",
                DenialReason::DailyLimitExceeded { limit, used }.to_string(),
                bar,
            ));
        }

        match snapshot.level {
            ProtectionLevel::Emergency => Some(Self::critical(
                "Credit protection active",
                DenialReason::EmergencyLockout { limit, used }.to_string(),
                bar,
            )),
            ProtectionLevel::Warning => {
                let left = snapshot.calls_remaining.limited().unwrap_or(0);
                Some(Self {
                    severity: BannerSeverity::Warning,
                    title: "Running low on free generations".to_string(),
                    message: format!(
                        "{} of {} free generations left today. Upgrade for unlimited access.",
                        left, limit
                    ),
                    show_upgrade: true,
                    bar,
                })
            }
            ProtectionLevel::Normal => match snapshot.balance_remaining {
                Credits::Limited(n) if n <= LOW_VAULT_BALANCE => Some(Self {
                    severity: BannerSeverity::Info,
                    title: "Vault credits running low".to_string(),
                    message: format!(
                        "{} vault credit{} left.",
                        n,
                        if n == 1 { "" } else { "s" }
                    ),
                    show_upgrade: false,
                    bar,
                }),
                _ => None,
            },
        }
    }

    fn critical(title: &str, message: String, bar: UsageBar) -> Self {
        Self {
            severity: BannerSeverity::Critical,
            title: title.to_string(),
            message,
            show_upgrade: true,
            bar,
        }
    }
}
