//! Consolidated quota service
//!
//! Single authority over both quota mechanisms. Each signed-in user gets a
//! [`CreditProtection`] session kept in a `DashMap`; consuming holds that
//! user's entry for the whole check-and-record so concurrent callers cannot
//! both take the last credit. The [`UsageLedger`] row is the source of
//! truth for daily counters and latches: sessions reload it on every access
//! and the ledger refuses increments past the limit, so several services
//! sharing one database file stay within the same quota. Vault credits live
//! on the profile.

use chrono::{Duration, NaiveDate};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::bypass::BypassFlag;
use super::clock::{Clock, SystemClock};
use super::protection::CreditProtection;
use super::types::{
    CreditCheck, Credits, DenialReason, Meter, ProtectionLevel, QuotaSnapshot, SubscriptionTier,
    UsageStats,
};
use super::usage::UsageLedger;
use super::vault::VaultQuota;
use crate::config::CreditProtectionConfig;
use crate::error::{CreditError, CreditResult};
use crate::profile::{
    next_login_streak, ContentKind, ContentRef, ProfileStore, SqliteProfileStore, UserProfile,
};
use crate::storage::{Database, LocalStorage};

/// Receipt for credits taken by [`QuotaService::try_consume`]
///
/// Hand it back to [`QuotaService::refund`] if the metered action failed.
/// Each receipt can be refunded once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumption {
    pub id: Uuid,
    pub uid: String,
    pub meter: Meter,
    /// Credits taken; at least 1
    pub amount: u32,
    /// Day the usage was booked against
    pub date: NaiveDate,
    /// Credits left after this consumption
    pub remaining: Credits,
    /// False when nothing was taken: bypass, or a paid tier drawing on the vault
    pub charged: bool,
}

pub struct QuotaService {
    config: CreditProtectionConfig,
    profiles: Arc<dyn ProfileStore>,
    ledger: UsageLedger,
    storage: LocalStorage,
    clock: Arc<dyn Clock>,
    bypass: BypassFlag,
    vault: VaultQuota,
    sessions: DashMap<String, CreditProtection>,
}

impl QuotaService {
    /// Build a service over explicit stores
    ///
    /// The bypass flag is loaded from `storage`.
    pub fn new(
        config: CreditProtectionConfig,
        profiles: Arc<dyn ProfileStore>,
        ledger: UsageLedger,
        storage: LocalStorage,
        clock: Arc<dyn Clock>,
    ) -> CreditResult<Self> {
        config.validate()?;
        let bypass = BypassFlag::load(&storage);
        Ok(Self {
            vault: VaultQuota::new(bypass.clone()),
            config,
            profiles,
            ledger,
            storage,
            clock,
            bypass,
            sessions: DashMap::new(),
        })
    }

    /// Open the SQLite database and local storage file inside `dir`
    pub fn open(config: CreditProtectionConfig, dir: &Path) -> CreditResult<Self> {
        let db = Arc::new(Database::open_in_dir(dir)?);
        let profiles = Arc::new(SqliteProfileStore::new(db.clone()));
        let service = Self::new(
            config,
            profiles,
            UsageLedger::new(db),
            LocalStorage::in_dir(dir),
            Arc::new(SystemClock),
        )?;
        info!(dir = ?dir, "Credit gate opened");
        Ok(service)
    }

    pub fn config(&self) -> &CreditProtectionConfig {
        &self.config
    }

    /// Shared handle to the bypass flag
    pub fn bypass(&self) -> &BypassFlag {
        &self.bypass
    }

    pub fn profile(&self, uid: &str) -> CreditResult<UserProfile> {
        self.profiles
            .get(uid)?
            .ok_or_else(|| CreditError::ProfileNotFound(uid.to_string()))
    }

    /// Get or create the profile, bump the login streak and load today's usage
    pub fn sign_in(&self, uid: &str, email: &str) -> CreditResult<UserProfile> {
        let now = self.clock.now();
        self.profiles.create(&UserProfile::new(
            uid,
            email,
            self.config.initial_vault_credits,
            now,
        ))?;

        let mut profile = self.profile(uid)?;
        let streak = next_login_streak(
            profile.login_streak,
            self.clock.local_date(profile.last_login),
            self.clock.local_date(now),
        );
        self.profiles.update_login(uid, now, streak)?;
        profile.last_login = now;
        profile.login_streak = streak;

        drop(self.session(&profile)?);
        info!(uid, tier = %profile.tier, streak, "User signed in");
        Ok(profile)
    }

    /// Drop the in-memory session; persisted usage is kept
    pub fn sign_out(&self, uid: &str) {
        if self.sessions.remove(uid).is_some() {
            info!(uid, "User signed out");
        }
    }

    pub fn snapshot(&self, uid: &str) -> CreditResult<QuotaSnapshot> {
        let profile = self.profile(uid)?;
        let session = self.session(&profile)?;
        let stats = session.stats();
        Ok(QuotaSnapshot {
            tier: profile.tier,
            bypass: self.bypass.is_active(),
            level: session.level(),
            daily_api_calls: stats.daily_api_calls,
            daily_limit: self.config.daily_free_limit,
            total_spend: stats.total_spend,
            calls_remaining: session.remaining_credits(),
            usage_percentage: session.usage_percentage(),
            balance_remaining: self.vault.balance(&profile),
            vault_locked: self.vault.is_locked(&profile),
        })
    }

    /// Check without consuming anything
    pub fn check(&self, uid: &str, meter: Meter, amount: u32) -> CreditResult<CreditCheck> {
        let profile = self.profile(uid)?;
        Ok(match meter {
            Meter::DailyCalls { .. } => self.session(&profile)?.check_credits(amount.max(1)),
            Meter::VaultCredits => self.vault.check(&profile, amount),
        })
    }

    /// Atomically check and take `amount` credits from `meter`
    ///
    /// An action always costs at least one credit, so `amount` 0 is charged
    /// as 1.
    pub fn try_consume(&self, uid: &str, meter: Meter, amount: u32) -> CreditResult<Consumption> {
        let amount = amount.max(1);
        let profile = self.profile(uid)?;
        let mut session = self.session(&profile)?;
        let date = self.clock.today();

        let (remaining, charged) = match meter {
            Meter::DailyCalls { cost } => {
                let charged = !self.bypass.is_active();
                let remaining = session.try_consume(amount, cost)?;
                if charged {
                    let spend = cost.max(0.0) * f64::from(amount);
                    let limit = (!profile.tier.is_paid()).then_some(self.config.daily_free_limit);
                    match self.ledger.record(uid, date, amount, spend, limit) {
                        Ok(true) => {
                            // The call is booked; a lost latch is re-derived on the next consume
                            if let Err(e) = self.save_latches(uid, &session) {
                                warn!(uid, error = %e, "Failed to persist protection latches");
                            }
                        }
                        Ok(false) => {
                            // Another writer took the remaining calls first
                            let state = self.ledger.load_day(uid, date)?;
                            let used = state.stats.daily_api_calls;
                            session.restore(state);
                            warn!(uid, used, "Daily limit reached by another session");
                            return Err(CreditError::QuotaExceeded(
                                DenialReason::DailyLimitExceeded {
                                    limit: self.config.daily_free_limit,
                                    used,
                                },
                            ));
                        }
                        Err(e) => {
                            error!(uid, error = %e, "Failed to persist usage, releasing credits");
                            session.release(amount, cost);
                            return Err(e);
                        }
                    }
                }
                (remaining, charged)
            }
            Meter::VaultCredits => {
                let remaining = self.vault.consume(self.profiles.as_ref(), &profile, amount)?;
                (remaining, !remaining.is_unlimited())
            }
        };

        Ok(Consumption {
            id: Uuid::new_v4(),
            uid: uid.to_string(),
            meter,
            amount,
            date,
            remaining,
            charged,
        })
    }

    /// Return credits taken by a consumption whose action failed
    ///
    /// Fails with [`CreditError::AlreadyRefunded`] if this consumption was
    /// refunded before, by this service or another one on the same database.
    pub fn refund(&self, consumption: Consumption) -> CreditResult<()> {
        if !consumption.charged || consumption.amount == 0 {
            return Ok(());
        }
        let uid = consumption.uid.as_str();

        if !self.ledger.mark_refunded(consumption.id, uid, self.clock.now())? {
            warn!(uid, id = %consumption.id, "Consumption already refunded");
            return Err(CreditError::AlreadyRefunded(consumption.id));
        }

        if let Err(e) = self.give_back(&consumption) {
            error!(uid, error = %e, "Failed to refund consumption");
            if let Err(unmark) = self.ledger.unmark_refunded(consumption.id) {
                error!(uid, error = %unmark, "Failed to release refund claim");
            }
            return Err(e);
        }

        info!(uid, amount = consumption.amount, "Refunded consumption");
        Ok(())
    }

    fn give_back(&self, consumption: &Consumption) -> CreditResult<()> {
        let uid = consumption.uid.as_str();
        let amount = consumption.amount;

        match consumption.meter {
            Meter::DailyCalls { cost } => {
                let spend = cost.max(0.0) * f64::from(amount);
                if consumption.date != self.clock.today() {
                    return self.ledger.refund(uid, consumption.date, amount, spend);
                }
                let profile = self.profile(uid)?;
                let mut session = self.session(&profile)?;
                self.ledger.refund(uid, consumption.date, amount, spend)?;
                session.release(amount, cost);
                self.save_latches(uid, &session)
            }
            Meter::VaultCredits => {
                self.profiles.add_vault_credits(uid, amount)?;
                Ok(())
            }
        }
    }

    pub fn reset_emergency(&self, uid: &str) -> CreditResult<()> {
        let profile = self.profile(uid)?;
        let mut session = self.session(&profile)?;
        session.reset_emergency_mode();
        self.save_latches(uid, &session)
    }

    pub fn force_disable_high_cost(&self, uid: &str) -> CreditResult<()> {
        let profile = self.profile(uid)?;
        let mut session = self.session(&profile)?;
        session.force_disable_high_cost_features();
        self.save_latches(uid, &session)
    }

    pub fn set_tier(&self, uid: &str, tier: SubscriptionTier) -> CreditResult<()> {
        self.profiles.set_tier(uid, tier)?;
        let profile = self.profile(uid)?;
        let session = self.session(&profile)?;
        self.save_latches(uid, &session)
    }

    /// Toggle the bypass flag on behalf of an admin
    pub fn set_bypass(&self, admin_uid: &str, enabled: bool) -> CreditResult<()> {
        let profile = self.profile(admin_uid)?;
        self.bypass.toggle(&profile, enabled, &self.storage)
    }

    /// Record a finished piece of content on the profile
    pub fn add_content(
        &self,
        uid: &str,
        kind: ContentKind,
        title: &str,
    ) -> CreditResult<ContentRef> {
        let content = ContentRef::new(kind, title, self.clock.now());
        self.profiles.add_content(uid, &content)?;
        Ok(content)
    }

    /// Persisted daily usage for the last `days` days, oldest first
    ///
    /// `days` 0 is an empty window.
    pub fn usage_history(&self, uid: &str, days: u32) -> CreditResult<Vec<UsageStats>> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let since = self.clock.today() - Duration::days(i64::from(days - 1));
        self.ledger.history(uid, since)
    }

    /// Delete usage records older than `keep_days` days
    pub fn prune_usage(&self, keep_days: u32) -> CreditResult<usize> {
        let cutoff = self.clock.today() - Duration::days(i64::from(keep_days));
        self.ledger.cleanup_before(cutoff)
    }

    /// Write the session's lockout and admin-alert latches to the ledger
    fn save_latches(&self, uid: &str, session: &CreditProtection) -> CreditResult<()> {
        self.ledger.save_latches(uid, &session.day_state())
    }

    /// The user's session, synced with the ledger's row for today
    ///
    /// The entry stays locked until the returned guard drops, so the reload
    /// and whatever the caller does next are one step for this user.
    fn session(&self, profile: &UserProfile) -> CreditResult<RefMut<'_, String, CreditProtection>> {
        let (mut session, resumed) = match self.sessions.entry(profile.uid.clone()) {
            Entry::Occupied(entry) => (entry.into_ref(), false),
            Entry::Vacant(entry) => (
                entry.insert(CreditProtection::new(
                    self.config.clone(),
                    profile.tier,
                    self.bypass.clone(),
                    self.clock.clone(),
                )),
                true,
            ),
        };

        session.restore(self.ledger.load_day(&profile.uid, self.clock.today())?);
        session.set_tier(profile.tier);

        if resumed && session.level() == ProtectionLevel::Emergency {
            warn!(uid = %profile.uid, "Session resumed in emergency mode");
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::clock::ManualClock;
    use crate::credits::protection::alert_capture::count_alerts;
    use crate::profile::MemoryProfileStore;
    use tempfile::{tempdir, TempDir};

    const DAILY: Meter = Meter::DailyCalls { cost: 0.1 };

    struct Harness {
        service: QuotaService,
        clock: Arc<ManualClock>,
        db: Arc<Database>,
        dir: TempDir,
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 1).unwrap()
    }

    fn harness(config: CreditProtectionConfig) -> Harness {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::on(day()));
        let service = build(config, &db, &dir, &clock);
        Harness {
            service,
            clock,
            db,
            dir,
        }
    }

    fn build(
        config: CreditProtectionConfig,
        db: &Arc<Database>,
        dir: &TempDir,
        clock: &Arc<ManualClock>,
    ) -> QuotaService {
        QuotaService::new(
            config,
            Arc::new(SqliteProfileStore::new(db.clone())),
            UsageLedger::new(db.clone()),
            LocalStorage::in_dir(dir.path()),
            clock.clone(),
        )
        .unwrap()
    }

    fn no_emergency() -> CreditProtectionConfig {
        CreditProtectionConfig {
            emergency_threshold: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sign_in_creates_free_profile() {
        let h = harness(CreditProtectionConfig::default());
        let profile = h.service.sign_in("u1", "u1@example.com").unwrap();
        assert_eq!(profile.tier, SubscriptionTier::Free);
        assert_eq!(profile.vault_credits, 10);
        assert_eq!(profile.login_streak, 1);

        let snap = h.service.snapshot("u1").unwrap();
        assert_eq!(snap.calls_remaining, Credits::Limited(10));
        assert_eq!(snap.balance_remaining, Credits::Limited(10));
        assert_eq!(snap.level, ProtectionLevel::Normal);
        assert!(!snap.vault_locked);
    }

    #[test]
    fn test_login_streak() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        assert_eq!(h.service.sign_in("u1", "u1@example.com").unwrap().login_streak, 1);

        h.clock.advance_days(1);
        assert_eq!(h.service.sign_in("u1", "u1@example.com").unwrap().login_streak, 2);

        h.clock.advance_days(3);
        assert_eq!(h.service.sign_in("u1", "u1@example.com").unwrap().login_streak, 1);
    }

    #[test]
    fn test_unknown_user() {
        let h = harness(CreditProtectionConfig::default());
        assert!(matches!(
            h.service.try_consume("ghost", DAILY, 1),
            Err(CreditError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn test_daily_consume_until_denied() {
        let h = harness(no_emergency());
        h.service.sign_in("u1", "u1@example.com").unwrap();

        for expected in (0..10).rev() {
            let c = h.service.try_consume("u1", DAILY, 1).unwrap();
            assert_eq!(c.remaining, Credits::Limited(expected));
            assert!(c.charged);
        }
        let err = h.service.try_consume("u1", DAILY, 1).unwrap_err();
        assert!(err.is_quota());
        assert_eq!(h.service.snapshot("u1").unwrap().usage_percentage, 100.0);
    }

    #[test]
    fn test_emergency_lockout_and_reset() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.try_consume("u1", DAILY, 9).unwrap();

        let snap = h.service.snapshot("u1").unwrap();
        assert_eq!(snap.level, ProtectionLevel::Emergency);
        assert!(!h.service.check("u1", DAILY, 1).unwrap().is_allowed());

        h.service.reset_emergency("u1").unwrap();
        assert!(h.service.check("u1", DAILY, 1).unwrap().is_allowed());
    }

    #[test]
    fn test_force_disable() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.force_disable_high_cost("u1").unwrap();
        assert_eq!(h.service.snapshot("u1").unwrap().level, ProtectionLevel::Emergency);
        assert!(h.service.try_consume("u1", DAILY, 1).is_err());
    }

    #[test]
    fn test_refund_restores_counters() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();

        let c = h.service.try_consume("u1", DAILY, 2).unwrap();
        assert_eq!(h.service.snapshot("u1").unwrap().daily_api_calls, 2);

        h.service.refund(c).unwrap();
        let snap = h.service.snapshot("u1").unwrap();
        assert_eq!(snap.daily_api_calls, 0);
        assert_eq!(snap.total_spend, 0.0);
        assert_eq!(
            UsageLedger::new(h.db.clone()).get_day("u1", day()).unwrap().daily_api_calls,
            0
        );
    }

    #[test]
    fn test_usage_survives_new_session() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.try_consume("u1", DAILY, 3).unwrap();

        // Reload on the same day
        let reloaded = build(CreditProtectionConfig::default(), &h.db, &h.dir, &h.clock);
        reloaded.sign_in("u1", "u1@example.com").unwrap();
        assert_eq!(reloaded.snapshot("u1").unwrap().daily_api_calls, 3);

        // Next day starts fresh
        h.clock.advance_days(1);
        assert_eq!(reloaded.snapshot("u1").unwrap().daily_api_calls, 0);
        h.service.sign_out("u1");
        assert_eq!(h.service.snapshot("u1").unwrap().daily_api_calls, 0);
    }

    #[test]
    fn test_vault_consume_and_lock() {
        let config = CreditProtectionConfig {
            initial_vault_credits: 2,
            ..Default::default()
        };
        let h = harness(config);
        h.service.sign_in("u1", "u1@example.com").unwrap();

        let first = h.service.try_consume("u1", Meter::VaultCredits, 1).unwrap();
        assert_eq!(first.remaining, Credits::Limited(1));
        h.service.try_consume("u1", Meter::VaultCredits, 1).unwrap();

        assert!(h.service.snapshot("u1").unwrap().vault_locked);
        assert!(h.service.try_consume("u1", Meter::VaultCredits, 1).is_err());

        h.service.refund(first).unwrap();
        let snap = h.service.snapshot("u1").unwrap();
        assert!(!snap.vault_locked);
        assert_eq!(snap.balance_remaining, Credits::Limited(1));
    }

    #[test]
    fn test_paid_tier_unmetered() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.set_tier("u1", SubscriptionTier::Premium).unwrap();

        for _ in 0..20 {
            // Paid daily calls are still booked for the admin alert
            assert!(h.service.try_consume("u1", DAILY, 1).unwrap().charged);
        }
        let vault = h.service.try_consume("u1", Meter::VaultCredits, 1).unwrap();
        assert!(!vault.charged);

        let snap = h.service.snapshot("u1").unwrap();
        assert_eq!(snap.calls_remaining, Credits::Unlimited);
        assert_eq!(snap.balance_remaining, Credits::Unlimited);
        assert_eq!(snap.level, ProtectionLevel::Normal);
        assert_eq!(h.service.profile("u1").unwrap().vault_credits, 10);
    }

    #[test]
    fn test_bypass_requires_admin() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("admin", "admin@example.com").unwrap();
        h.service.sign_in("u1", "u1@example.com").unwrap();

        assert!(matches!(
            h.service.set_bypass("u1", true),
            Err(CreditError::NotAdmin(_))
        ));

        SqliteProfileStore::new(h.db.clone()).set_admin("admin", true).unwrap();
        h.service.set_bypass("admin", true).unwrap();

        // Shared flag applies to every session
        let c = h.service.try_consume("u1", DAILY, 50).unwrap();
        assert!(!c.charged);
        assert_eq!(c.remaining, Credits::Unlimited);
        assert!(h.service.snapshot("u1").unwrap().bypass);
        assert_eq!(h.service.snapshot("u1").unwrap().daily_api_calls, 0);

        // Persisted for the next session
        let reloaded = build(CreditProtectionConfig::default(), &h.db, &h.dir, &h.clock);
        assert!(reloaded.bypass().is_active());
    }

    #[test]
    fn test_concurrent_consume_never_exceeds_limit() {
        let store = Arc::new(MemoryProfileStore::new());
        let dir = tempdir().unwrap();
        let service = Arc::new(
            QuotaService::new(
                no_emergency(),
                store,
                UsageLedger::new(Arc::new(Database::open_in_memory().unwrap())),
                LocalStorage::in_dir(dir.path()),
                Arc::new(ManualClock::on(day())),
            )
            .unwrap(),
        );
        service.sign_in("u1", "u1@example.com").unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let service = service.clone();
                std::thread::spawn(move || service.try_consume("u1", DAILY, 1).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 10);
        assert_eq!(service.snapshot("u1").unwrap().daily_api_calls, 10);
    }

    #[test]
    fn test_content_and_history() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.try_consume("u1", DAILY, 1).unwrap();
        h.clock.advance_days(1);
        h.service.try_consume("u1", DAILY, 2).unwrap();

        let history = h.service.usage_history("u1", 7).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].daily_api_calls, 2);

        assert_eq!(h.service.prune_usage(0).unwrap(), 1);

        let content = h.service.add_content("u1", ContentKind::Art, "Sunset").unwrap();
        assert_eq!(h.service.profile("u1").unwrap().content[0].id, content.id);
    }

    #[test]
    fn test_services_sharing_a_database_share_the_limit() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::on(day()));
        let first_db = Arc::new(Database::open_in_dir(dir.path()).unwrap());
        let second_db = Arc::new(Database::open_in_dir(dir.path()).unwrap());
        let first = build(no_emergency(), &first_db, &dir, &clock);
        let second = build(no_emergency(), &second_db, &dir, &clock);
        first.sign_in("u1", "u1@example.com").unwrap();
        second.sign_in("u1", "u1@example.com").unwrap();

        let mut granted = 0;
        for _ in 0..10 {
            for service in [&first, &second] {
                match service.try_consume("u1", DAILY, 1) {
                    Ok(_) => granted += 1,
                    Err(e) => assert!(e.is_quota()),
                }
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(first.snapshot("u1").unwrap().daily_api_calls, 10);
        assert_eq!(second.snapshot("u1").unwrap().calls_remaining, Credits::Limited(0));
    }

    #[test]
    fn test_other_service_usage_visible_without_sign_in() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::on(day()));
        let first_db = Arc::new(Database::open_in_dir(dir.path()).unwrap());
        let second_db = Arc::new(Database::open_in_dir(dir.path()).unwrap());
        let first = build(no_emergency(), &first_db, &dir, &clock);
        let second = build(no_emergency(), &second_db, &dir, &clock);
        first.sign_in("u1", "u1@example.com").unwrap();
        second.sign_in("u1", "u1@example.com").unwrap();

        first.try_consume("u1", DAILY, 9).unwrap();
        assert_eq!(second.snapshot("u1").unwrap().daily_api_calls, 9);
        assert!(second.try_consume("u1", DAILY, 2).unwrap_err().is_quota());
        assert_eq!(second.try_consume("u1", DAILY, 1).unwrap().remaining, Credits::Limited(0));
        assert!(first.try_consume("u1", DAILY, 1).unwrap_err().is_quota());
    }

    #[test]
    fn test_zero_amount_costs_one_credit() {
        let config = CreditProtectionConfig {
            initial_vault_credits: 0,
            ..Default::default()
        };
        let h = harness(config);
        h.service.sign_in("u1", "u1@example.com").unwrap();

        let c = h.service.try_consume("u1", DAILY, 0).unwrap();
        assert_eq!(c.amount, 1);
        assert_eq!(h.service.snapshot("u1").unwrap().daily_api_calls, 1);

        assert!(!h.service.check("u1", Meter::VaultCredits, 0).unwrap().is_allowed());
        let err = h.service.try_consume("u1", Meter::VaultCredits, 0).unwrap_err();
        assert!(matches!(err, CreditError::QuotaExceeded(DenialReason::VaultEmpty)));
    }

    #[test]
    fn test_refund_only_once() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();

        h.service.try_consume("u1", DAILY, 1).unwrap();
        let daily = h.service.try_consume("u1", DAILY, 1).unwrap();
        h.service.refund(daily.clone()).unwrap();
        let err = h.service.refund(daily.clone()).unwrap_err();
        assert!(matches!(err, CreditError::AlreadyRefunded(id) if id == daily.id));
        assert_eq!(h.service.snapshot("u1").unwrap().daily_api_calls, 1);

        let vault = h.service.try_consume("u1", Meter::VaultCredits, 1).unwrap();
        h.service.refund(vault.clone()).unwrap();
        assert!(h.service.refund(vault.clone()).is_err());
        assert_eq!(h.service.profile("u1").unwrap().vault_credits, 10);

        // The claim is shared through the database
        let reloaded = build(CreditProtectionConfig::default(), &h.db, &h.dir, &h.clock);
        assert!(matches!(
            reloaded.refund(vault),
            Err(CreditError::AlreadyRefunded(_))
        ));
        assert_eq!(reloaded.profile("u1").unwrap().vault_credits, 10);
    }

    #[test]
    fn test_forced_lockout_survives_sign_out() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.force_disable_high_cost("u1").unwrap();

        h.service.sign_out("u1");
        h.service.sign_in("u1", "u1@example.com").unwrap();
        assert!(h.service.try_consume("u1", DAILY, 1).unwrap_err().is_quota());

        let reloaded = build(CreditProtectionConfig::default(), &h.db, &h.dir, &h.clock);
        reloaded.sign_in("u1", "u1@example.com").unwrap();
        assert_eq!(reloaded.snapshot("u1").unwrap().level, ProtectionLevel::Emergency);

        // Reset through one service is seen by the other
        reloaded.reset_emergency("u1").unwrap();
        assert_eq!(h.service.snapshot("u1").unwrap().level, ProtectionLevel::Normal);
        assert!(h.service.try_consume("u1", DAILY, 1).is_ok());

        // Cleared by the next day
        h.service.force_disable_high_cost("u1").unwrap();
        h.clock.advance_days(1);
        h.service.sign_out("u1");
        assert!(h.service.try_consume("u1", DAILY, 1).is_ok());
    }

    #[test]
    fn test_manual_reset_survives_sign_out() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.try_consume("u1", DAILY, 9).unwrap();
        h.service.reset_emergency("u1").unwrap();

        h.service.sign_out("u1");
        h.service.sign_in("u1", "u1@example.com").unwrap();
        assert!(h.service.check("u1", DAILY, 1).unwrap().is_allowed());
        assert_ne!(h.service.snapshot("u1").unwrap().level, ProtectionLevel::Emergency);
    }

    #[test]
    fn test_malformed_local_storage_does_not_block_startup() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::in_dir(dir.path());
        std::fs::write(storage.path(), r#"{"godMode": true}"#).unwrap();

        let service = QuotaService::new(
            CreditProtectionConfig::default(),
            Arc::new(MemoryProfileStore::new()),
            UsageLedger::new(Arc::new(Database::open_in_memory().unwrap())),
            storage,
            Arc::new(ManualClock::on(day())),
        )
        .unwrap();
        assert!(!service.bypass().is_active());
    }

    #[test]
    fn test_admin_alert_not_repeated_after_reload() {
        let config = CreditProtectionConfig {
            admin_alert_threshold: 0.3,
            ..no_emergency()
        };
        let h = harness(config.clone());
        h.service.sign_in("u1", "u1@example.com").unwrap();

        let alerts = count_alerts(|| {
            h.service.try_consume("u1", DAILY, 2).unwrap();
            h.service.try_consume("u1", DAILY, 2).unwrap();
        });
        assert_eq!(alerts, 1);
        assert!(UsageLedger::new(h.db.clone()).load_day("u1", day()).unwrap().admin_alerted);

        let reloaded = build(config, &h.db, &h.dir, &h.clock);
        let alerts = count_alerts(|| {
            reloaded.sign_in("u1", "u1@example.com").unwrap();
            reloaded.try_consume("u1", DAILY, 1).unwrap();
            h.service.sign_out("u1");
            h.service.try_consume("u1", DAILY, 1).unwrap();
        });
        assert_eq!(alerts, 0);

        // A new day alerts again
        h.clock.advance_days(1);
        let alerts = count_alerts(|| {
            h.service.try_consume("u1", DAILY, 4).unwrap();
        });
        assert_eq!(alerts, 1);
    }

    #[test]
    fn test_usage_history_window() {
        let h = harness(CreditProtectionConfig::default());
        h.service.sign_in("u1", "u1@example.com").unwrap();
        h.service.try_consume("u1", DAILY, 1).unwrap();
        h.clock.advance_days(1);
        h.service.try_consume("u1", DAILY, 1).unwrap();

        assert!(h.service.usage_history("u1", 0).unwrap().is_empty());
        let today = h.service.usage_history("u1", 1).unwrap();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].last_reset, day() + Duration::days(1));
    }
}
