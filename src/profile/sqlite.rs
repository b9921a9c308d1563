//! SQLite-backed profile store

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{ContentKind, ContentRef, ProfileStore, UserProfile};
use crate::credits::SubscriptionTier;
use crate::error::{CreditError, CreditResult};
use crate::storage::Database;

pub struct SqliteProfileStore {
    db: Arc<Database>,
}

impl SqliteProfileStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn require_changed(changed: usize, uid: &str) -> CreditResult<()> {
        if changed == 0 {
            return Err(CreditError::ProfileNotFound(uid.to_string()));
        }
        Ok(())
    }

    fn load_content(conn: &Connection, uid: &str) -> CreditResult<Vec<ContentRef>> {
        let mut stmt = conn.prepare(
            "SELECT id, kind, title, created_at FROM profile_content
             WHERE uid = ? ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![uid], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(1)?;
            Ok(ContentRef {
                id: id.parse::<Uuid>().map_err(|e| conversion_error(0, e))?,
                kind: kind
                    .parse::<ContentKind>()
                    .map_err(|e| conversion_error(1, e))?,
                title: row.get(2)?,
                created_at: timestamp(row, 3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl ProfileStore for SqliteProfileStore {
    fn get(&self, uid: &str) -> CreditResult<Option<UserProfile>> {
        let conn = self.db.conn();
        let profile = conn
            .query_row(
                "SELECT uid, email, display_name, tier, vault_credits, login_streak,
                        is_admin, created_at, last_login
                 FROM profiles WHERE uid = ?",
                params![uid],
                |row| {
                    let tier: String = row.get(3)?;
                    Ok(UserProfile {
                        uid: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        tier: tier
                            .parse::<SubscriptionTier>()
                            .map_err(|e| conversion_error(3, e))?,
                        vault_credits: row.get(4)?,
                        login_streak: row.get(5)?,
                        is_admin: row.get(6)?,
                        created_at: timestamp(row, 7)?,
                        last_login: timestamp(row, 8)?,
                        content: Vec::new(),
                    })
                },
            )
            .optional()?;

        match profile {
            Some(mut profile) => {
                profile.content = Self::load_content(&conn, uid)?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    fn create(&self, profile: &UserProfile) -> CreditResult<()> {
        let conn = self.db.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO profiles
                (uid, email, display_name, tier, vault_credits, login_streak,
                 is_admin, created_at, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                profile.uid,
                profile.email,
                profile.display_name,
                profile.tier.as_str(),
                profile.vault_credits,
                profile.login_streak,
                profile.is_admin,
                profile.created_at.to_rfc3339(),
                profile.last_login.to_rfc3339(),
            ],
        )?;
        if inserted > 0 {
            debug!(uid = %profile.uid, "Created profile");
        }
        Ok(())
    }

    fn update_login(&self, uid: &str, last_login: DateTime<Utc>, streak: u32) -> CreditResult<()> {
        let changed = self.db.conn().execute(
            "UPDATE profiles SET last_login = ?2, login_streak = ?3 WHERE uid = ?1",
            params![uid, last_login.to_rfc3339(), streak],
        )?;
        Self::require_changed(changed, uid)
    }

    fn set_tier(&self, uid: &str, tier: SubscriptionTier) -> CreditResult<()> {
        let changed = self.db.conn().execute(
            "UPDATE profiles SET tier = ?2 WHERE uid = ?1",
            params![uid, tier.as_str()],
        )?;
        Self::require_changed(changed, uid)
    }

    fn set_admin(&self, uid: &str, is_admin: bool) -> CreditResult<()> {
        let changed = self.db.conn().execute(
            "UPDATE profiles SET is_admin = ?2 WHERE uid = ?1",
            params![uid, is_admin],
        )?;
        Self::require_changed(changed, uid)
    }

    fn set_display_name(&self, uid: &str, display_name: Option<&str>) -> CreditResult<()> {
        let changed = self.db.conn().execute(
            "UPDATE profiles SET display_name = ?2 WHERE uid = ?1",
            params![uid, display_name],
        )?;
        Self::require_changed(changed, uid)
    }

    fn decrement_vault_credits(&self, uid: &str) -> CreditResult<Option<u32>> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE profiles SET vault_credits = vault_credits - 1
             WHERE uid = ? AND vault_credits > 0",
            params![uid],
        )?;

        let balance: Option<u32> = conn
            .query_row(
                "SELECT vault_credits FROM profiles WHERE uid = ?",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;

        match balance {
            None => Err(CreditError::ProfileNotFound(uid.to_string())),
            Some(balance) if changed > 0 => {
                debug!(uid, balance, "Decremented vault credits");
                Ok(Some(balance))
            }
            Some(_) => Ok(None),
        }
    }

    fn add_vault_credits(&self, uid: &str, amount: u32) -> CreditResult<u32> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE profiles SET vault_credits = vault_credits + ?2 WHERE uid = ?1",
            params![uid, amount],
        )?;
        Self::require_changed(changed, uid)?;
        let balance = conn.query_row(
            "SELECT vault_credits FROM profiles WHERE uid = ?",
            params![uid],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    fn add_content(&self, uid: &str, content: &ContentRef) -> CreditResult<()> {
        let conn = self.db.conn();
        let result = conn.execute(
            "INSERT INTO profile_content (id, uid, kind, title, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                content.id.to_string(),
                uid,
                content.kind.as_str(),
                content.title,
                content.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            // Foreign key violation: no such profile
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(CreditError::ProfileNotFound(uid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::fmt::Display,
{
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        err.to_string().into(),
    )
}
