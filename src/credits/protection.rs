//! Credit protection for metered AI actions
//!
//! Gates free-tier users against a daily call limit and walks the
//! Normal -> Warning -> Emergency state machine as usage grows. Paid tiers
//! and the bypass flag are never metered.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::bypass::BypassFlag;
use super::clock::Clock;
use super::types::{
    CreditCheck, Credits, DayState, DenialReason, Lockout, ProtectionLevel, SubscriptionTier,
    UsageStats,
};
use crate::config::CreditProtectionConfig;
use crate::error::{CreditError, CreditResult};

/// Per-session credit protection policy
pub struct CreditProtection {
    config: CreditProtectionConfig,
    tier: SubscriptionTier,
    bypass: BypassFlag,
    clock: Arc<dyn Clock>,
    stats: UsageStats,
    lockout: Option<Lockout>,
    admin_alerted: bool,
}

impl CreditProtection {
    pub fn new(
        config: CreditProtectionConfig,
        tier: SubscriptionTier,
        bypass: BypassFlag,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = UsageStats::new(clock.today());
        Self {
            config,
            tier,
            bypass,
            clock,
            stats,
            lockout: None,
            admin_alerted: false,
        }
    }

    /// Resume from previously persisted counters
    ///
    /// Stale counters (from an earlier day) are discarded.
    pub fn with_stats(mut self, stats: UsageStats) -> Self {
        self.stats = stats;
        self.roll_over();
        self.evaluate();
        self
    }

    /// Resume from a persisted day, latches included
    pub fn with_state(mut self, state: DayState) -> Self {
        self.restore(state);
        self
    }

    /// Replace counters and latches with persisted ones
    ///
    /// The latches are taken as stored rather than re-evaluated, so a manual
    /// reset or a forced lockout survives a reload. A stale day is discarded.
    pub fn restore(&mut self, state: DayState) {
        self.stats = state.stats;
        self.lockout = state.lockout;
        self.admin_alerted = state.admin_alerted;
        self.roll_over();
    }

    /// Counters and latches as of today, for persisting
    pub fn day_state(&self) -> DayState {
        if self.is_stale() {
            return DayState::new(self.clock.today());
        }
        DayState {
            stats: self.stats.clone(),
            lockout: self.lockout,
            admin_alerted: self.admin_alerted,
        }
    }

    /// Active lockout, if any
    pub fn lockout(&self) -> Option<Lockout> {
        if self.is_stale() {
            None
        } else {
            self.lockout
        }
    }

    /// Whether today's admin alert has already fired
    pub fn admin_alerted(&self) -> bool {
        self.admin_alerted && !self.is_stale()
    }

    pub fn config(&self) -> &CreditProtectionConfig {
        &self.config
    }

    pub fn tier(&self) -> SubscriptionTier {
        self.tier
    }

    pub fn set_tier(&mut self, tier: SubscriptionTier) {
        if self.tier != tier {
            info!(from = %self.tier, to = %tier, "Subscription tier changed");
            self.tier = tier;
            self.evaluate();
        }
    }

    pub fn bypass(&self) -> &BypassFlag {
        &self.bypass
    }

    /// Counters as of today (zeroed if the date rolled over)
    pub fn stats(&self) -> UsageStats {
        if self.is_stale() {
            UsageStats::new(self.clock.today())
        } else {
            self.stats.clone()
        }
    }

    /// Whether `amount` more metered calls are permitted
    pub fn can_use_credits(&self, amount: u32) -> bool {
        self.check_credits(amount).is_allowed()
    }

    /// Check `amount` metered calls, returning the reason on denial
    pub fn check_credits(&self, amount: u32) -> CreditCheck {
        if self.is_unmetered() {
            return CreditCheck::Allowed {
                remaining: Credits::Unlimited,
            };
        }

        let limit = self.config.daily_free_limit;
        let used = self.used_today();

        if self.emergency_active() {
            return CreditCheck::Denied {
                reason: DenialReason::EmergencyLockout { limit, used },
            };
        }

        if used.saturating_add(amount) > limit {
            debug!(used, amount, limit, "Daily free limit would be exceeded");
            return CreditCheck::Denied {
                reason: DenialReason::DailyLimitExceeded { limit, used },
            };
        }

        CreditCheck::Allowed {
            remaining: Credits::Limited(limit - used),
        }
    }

    /// Record one metered call after it was made
    ///
    /// No-op under bypass. Callers that can should prefer [`Self::try_consume`],
    /// which checks and records in one step.
    pub fn record_usage(&mut self, cost: f64) {
        if self.bypass.is_active() {
            debug!("Bypass active, usage not recorded");
            return;
        }
        self.roll_over();
        self.stats.daily_api_calls = self.stats.daily_api_calls.saturating_add(1);
        self.stats.total_spend += cost.max(0.0);
        debug!(
            calls = self.stats.daily_api_calls,
            spend = self.stats.total_spend,
            "Recorded metered call"
        );
        self.evaluate();
    }

    /// [`Self::record_usage`] at the configured per-call cost
    pub fn record_default_usage(&mut self) {
        self.record_usage(self.config.default_action_cost);
    }

    /// Atomically check and record `amount` calls of `cost` each
    ///
    /// Returns the credits remaining afterwards.
    pub fn try_consume(&mut self, amount: u32, cost: f64) -> CreditResult<Credits> {
        self.roll_over();
        if let CreditCheck::Denied { reason } = self.check_credits(amount) {
            warn!(%reason, tier = %self.tier, "Metered action denied");
            return Err(CreditError::QuotaExceeded(reason));
        }
        if self.bypass.is_active() {
            return Ok(Credits::Unlimited);
        }

        self.stats.daily_api_calls = self.stats.daily_api_calls.saturating_add(amount);
        self.stats.total_spend += cost.max(0.0) * f64::from(amount);
        debug!(
            calls = self.stats.daily_api_calls,
            amount,
            "Consumed daily credits"
        );
        self.evaluate();
        Ok(self.remaining_credits())
    }

    /// Give back calls consumed by [`Self::try_consume`] whose action failed
    pub fn release(&mut self, amount: u32, cost: f64) {
        if self.bypass.is_active() || self.is_stale() {
            return;
        }
        self.stats.daily_api_calls = self.stats.daily_api_calls.saturating_sub(amount);
        self.stats.total_spend = (self.stats.total_spend - cost.max(0.0) * f64::from(amount)).max(0.0);
        if self.lockout == Some(Lockout::Threshold) && self.ratio() < self.config.emergency_threshold {
            self.lockout = None;
        }
        debug!(calls = self.stats.daily_api_calls, amount, "Released daily credits");
    }

    pub fn remaining_credits(&self) -> Credits {
        if self.is_unmetered() {
            return Credits::Unlimited;
        }
        Credits::Limited(self.config.daily_free_limit.saturating_sub(self.used_today()))
    }

    /// Share of the daily limit used, in `[0, 100]`
    pub fn usage_percentage(&self) -> f64 {
        if self.is_unmetered() {
            return 0.0;
        }
        (self.ratio() * 100.0).clamp(0.0, 100.0)
    }

    pub fn level(&self) -> ProtectionLevel {
        if self.is_unmetered() {
            ProtectionLevel::Normal
        } else if self.emergency_active() {
            ProtectionLevel::Emergency
        } else if self.ratio() >= self.config.warning_threshold {
            ProtectionLevel::Warning
        } else {
            ProtectionLevel::Normal
        }
    }

    /// Clear the lockout without touching the counters
    pub fn reset_emergency_mode(&mut self) {
        if self.lockout.take().is_some() {
            info!(calls = self.stats.daily_api_calls, "Emergency mode reset");
        }
    }

    /// Lock all metered actions until reset or the next day
    pub fn force_disable_high_cost_features(&mut self) {
        if self.bypass.is_active() {
            return;
        }
        self.roll_over();
        self.lockout = Some(Lockout::Forced);
        warn!(tier = %self.tier, "High-cost features force-disabled");
    }

    fn is_unmetered(&self) -> bool {
        self.bypass.is_active() || self.tier.is_paid()
    }

    fn is_stale(&self) -> bool {
        self.stats.is_stale(self.clock.today())
    }

    fn used_today(&self) -> u32 {
        if self.is_stale() {
            0
        } else {
            self.stats.daily_api_calls
        }
    }

    fn ratio(&self) -> f64 {
        f64::from(self.used_today()) / f64::from(self.config.daily_free_limit.max(1))
    }

    fn emergency_active(&self) -> bool {
        self.lockout.is_some() && !self.is_stale()
    }

    fn roll_over(&mut self) {
        let today = self.clock.today();
        if self.stats.is_stale(today) {
            debug!(
                previous = %self.stats.last_reset,
                %today,
                "Date rolled over, resetting daily usage"
            );
            self.stats = UsageStats::new(today);
            self.lockout = None;
            self.admin_alerted = false;
        }
    }

    /// Apply state-machine transitions after counters changed
    fn evaluate(&mut self) {
        if self.bypass.is_active() {
            return;
        }

        if !self.admin_alerted && self.stats.total_spend >= self.config.admin_alert_threshold {
            self.admin_alerted = true;
            warn!(
                target: "admin_alert",
                spend = self.stats.total_spend,
                threshold = self.config.admin_alert_threshold,
                tier = %self.tier,
                "Daily spend crossed admin alert threshold"
            );
        }

        if self.tier.is_paid() || self.lockout.is_some() {
            return;
        }

        let ratio = self.ratio();
        if ratio >= self.config.emergency_threshold {
            self.lockout = Some(Lockout::Threshold);
            warn!(
                calls = self.stats.daily_api_calls,
                limit = self.config.daily_free_limit,
                "Emergency credit protection engaged"
            );
        } else if ratio >= self.config.warning_threshold {
            debug!(
                calls = self.stats.daily_api_calls,
                limit = self.config.daily_free_limit,
                "Credit usage above warning threshold"
            );
        }
    }
}

impl std::fmt::Debug for CreditProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditProtection")
            .field("tier", &self.tier)
            .field("bypass", &self.bypass.is_active())
            .field("stats", &self.stats)
            .field("lockout", &self.lockout)
            .finish()
    }
}
