//! Configuration for credit protection
//!
//! Values come from the environment (after `.env` is loaded) and fall back
//! to the defaults used by the free tier.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{CreditError, CreditResult};

/// Static credit-protection settings, immutable for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditProtectionConfig {
    /// Metered calls a free-tier user may make per day
    pub daily_free_limit: u32,
    /// Usage ratio at which the warning banner appears
    pub warning_threshold: f64,
    /// Usage ratio at which all metered actions are locked
    pub emergency_threshold: f64,
    /// Daily spend (USD) that triggers an admin alert
    pub admin_alert_threshold: f64,
    /// Estimated cost (USD) of a single metered call
    pub default_action_cost: f64,
    /// Vault credits granted to a new profile
    pub initial_vault_credits: u32,
}

impl Default for CreditProtectionConfig {
    fn default() -> Self {
        Self {
            daily_free_limit: 10,
            warning_threshold: 0.8,
            emergency_threshold: 0.9,
            admin_alert_threshold: 5.0,
            default_action_cost: 0.1,
            initial_vault_credits: 10,
        }
    }
}

impl CreditProtectionConfig {
    /// Load from `CREDIT_*` environment variables, using defaults for unset ones
    pub fn from_env() -> CreditResult<Self> {
        let defaults = Self::default();
        let config = Self {
            daily_free_limit: env_or("CREDIT_DAILY_FREE_LIMIT", defaults.daily_free_limit)?,
            warning_threshold: env_or("CREDIT_WARNING_THRESHOLD", defaults.warning_threshold)?,
            emergency_threshold: env_or(
                "CREDIT_EMERGENCY_THRESHOLD",
                defaults.emergency_threshold,
            )?,
            admin_alert_threshold: env_or(
                "CREDIT_ADMIN_ALERT_THRESHOLD",
                defaults.admin_alert_threshold,
            )?,
            default_action_cost: env_or(
                "CREDIT_DEFAULT_ACTION_COST",
                defaults.default_action_cost,
            )?,
            initial_vault_credits: env_or(
                "CREDIT_INITIAL_VAULT_CREDITS",
                defaults.initial_vault_credits,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that limits and thresholds are usable
    pub fn validate(&self) -> CreditResult<()> {
        if self.daily_free_limit == 0 {
            return Err(CreditError::Config(
                "daily_free_limit must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("warning_threshold", self.warning_threshold),
            ("emergency_threshold", self.emergency_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CreditError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.warning_threshold > self.emergency_threshold {
            return Err(CreditError::Config(format!(
                "warning_threshold ({}) exceeds emergency_threshold ({})",
                self.warning_threshold, self.emergency_threshold
            )));
        }
        if self.admin_alert_threshold < 0.0 || self.default_action_cost < 0.0 {
            return Err(CreditError::Config(
                "costs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Directory holding the credits database and local storage file
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CREDIT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("credit-gate")
}

fn env_or<T: FromStr>(key: &str, default: T) -> CreditResult<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CreditError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
