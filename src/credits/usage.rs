//! SQLite-backed daily usage ledger
//!
//! Persists the per-user daily call counter and spend so a new session on
//! the same day resumes where the last one stopped. Dates are the user's
//! local calendar date, supplied by the caller's clock.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::types::{DayState, Lockout, UsageStats};
use crate::error::CreditResult;
use crate::storage::Database;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct UsageLedger {
    db: Arc<Database>,
}

impl UsageLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Usage recorded for `uid` on `date` (zeros if none)
    pub fn get_day(&self, uid: &str, date: NaiveDate) -> CreditResult<UsageStats> {
        Ok(self.load_day(uid, date)?.stats)
    }

    /// Counters and latches stored for `uid` on `date`
    pub fn load_day(&self, uid: &str, date: NaiveDate) -> CreditResult<DayState> {
        let conn = self.db.conn();
        let row: Option<(u32, f64, Option<String>, bool)> = conn
            .query_row(
                "SELECT api_calls, total_spend, lockout, admin_alerted
                 FROM daily_usage WHERE uid = ? AND date = ?",
                params![uid, date.format(DATE_FORMAT).to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((daily_api_calls, total_spend, lockout, admin_alerted)) = row else {
            return Ok(DayState::new(date));
        };
        let lockout = lockout
            .map(|raw| {
                raw.parse::<Lockout>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })
            })
            .transpose()?;

        Ok(DayState {
            stats: UsageStats {
                daily_api_calls,
                total_spend,
                last_reset: date,
            },
            lockout,
            admin_alerted,
        })
    }

    /// Add calls and spend for `date` unless that would push the stored
    /// counter past `limit`
    ///
    /// The check and the increment are one statement, so writers on other
    /// connections to the same file cannot both take the last call. Returns
    /// `false` (and changes nothing) when the limit would be exceeded.
    pub fn record(
        &self,
        uid: &str,
        date: NaiveDate,
        calls: u32,
        spend: f64,
        limit: Option<u32>,
    ) -> CreditResult<bool> {
        let changed = self.db.conn().execute(
            r#"
            INSERT INTO daily_usage (uid, date, api_calls, total_spend)
            SELECT ?1, ?2, ?3, MAX(0, ?4) WHERE ?5 IS NULL OR ?3 <= ?5
            ON CONFLICT(uid, date) DO UPDATE SET
                api_calls = daily_usage.api_calls + excluded.api_calls,
                total_spend = daily_usage.total_spend + excluded.total_spend
            WHERE ?5 IS NULL OR daily_usage.api_calls + excluded.api_calls <= ?5
            "#,
            params![uid, date.format(DATE_FORMAT).to_string(), calls, spend, limit],
        )?;

        let recorded = changed > 0;
        if recorded {
            debug!(uid, %date, calls, spend, "Recorded usage");
        } else {
            debug!(uid, %date, calls, ?limit, "Usage refused, stored limit reached");
        }
        Ok(recorded)
    }

    /// Take back calls and spend for `date`, never going below zero
    pub fn refund(&self, uid: &str, date: NaiveDate, calls: u32, spend: f64) -> CreditResult<()> {
        self.db.conn().execute(
            r#"
            INSERT INTO daily_usage (uid, date, api_calls, total_spend)
            VALUES (?1, ?2, 0, 0)
            ON CONFLICT(uid, date) DO UPDATE SET
                api_calls = MAX(0, api_calls - ?3),
                total_spend = MAX(0, total_spend - ?4)
            "#,
            params![uid, date.format(DATE_FORMAT).to_string(), calls, spend.max(0.0)],
        )?;
        debug!(uid, %date, calls, spend, "Refunded usage");
        Ok(())
    }

    /// Store the lockout and admin-alert latches for the state's day
    ///
    /// Counters are left alone. Once set, the admin-alert latch stays set
    /// for the day.
    pub fn save_latches(&self, uid: &str, state: &DayState) -> CreditResult<()> {
        self.db.conn().execute(
            r#"
            INSERT INTO daily_usage (uid, date, lockout, admin_alerted)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(uid, date) DO UPDATE SET
                lockout = excluded.lockout,
                admin_alerted = MAX(admin_alerted, excluded.admin_alerted)
            "#,
            params![
                uid,
                state.stats.last_reset.format(DATE_FORMAT).to_string(),
                state.lockout.map(|l| l.as_str()),
                state.admin_alerted,
            ],
        )?;
        Ok(())
    }

    /// Claim the refund of consumption `id`
    ///
    /// Returns `false` if it was already refunded.
    pub fn mark_refunded(&self, id: Uuid, uid: &str, at: DateTime<Utc>) -> CreditResult<bool> {
        let inserted = self.db.conn().execute(
            "INSERT OR IGNORE INTO refunds (consumption_id, uid, refunded_at) VALUES (?, ?, ?)",
            params![id.to_string(), uid, at.to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    /// Release a claim taken by [`Self::mark_refunded`] whose refund failed
    pub fn unmark_refunded(&self, id: Uuid) -> CreditResult<()> {
        self.db.conn().execute(
            "DELETE FROM refunds WHERE consumption_id = ?",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Daily records on or after `since`, oldest first
    pub fn history(&self, uid: &str, since: NaiveDate) -> CreditResult<Vec<UsageStats>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT date, api_calls, total_spend FROM daily_usage
             WHERE uid = ? AND date >= ?
             ORDER BY date ASC",
        )?;

        let rows = stmt.query_map(
            params![uid, since.format(DATE_FORMAT).to_string()],
            |row| {
                let date: String = row.get(0)?;
                let last_reset = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(UsageStats {
                    daily_api_calls: row.get(1)?,
                    total_spend: row.get(2)?,
                    last_reset,
                })
            },
        )?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete records older than `cutoff`
    pub fn cleanup_before(&self, cutoff: NaiveDate) -> CreditResult<usize> {
        let cutoff_key = cutoff.format(DATE_FORMAT).to_string();
        let conn = self.db.conn();
        let deleted = conn.execute("DELETE FROM daily_usage WHERE date < ?", params![cutoff_key])?;
        conn.execute("DELETE FROM refunds WHERE refunded_at < ?", params![cutoff_key])?;
        if deleted > 0 {
            debug!(deleted, %cutoff, "Cleaned up old usage records");
        }
        Ok(deleted)
    }
}
