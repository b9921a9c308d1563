//! SQLite database shared by the profile store and usage ledger

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CreditResult;

const DB_FILENAME: &str = "credits.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS profiles (
        uid TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        display_name TEXT,
        tier TEXT NOT NULL DEFAULT 'free',
        vault_credits INTEGER NOT NULL DEFAULT 0,
        login_streak INTEGER NOT NULL DEFAULT 1,
        is_admin INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        last_login TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS profile_content (
        id TEXT PRIMARY KEY,
        uid TEXT NOT NULL REFERENCES profiles(uid),
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_content_uid
        ON profile_content(uid, created_at DESC);

    CREATE TABLE IF NOT EXISTS daily_usage (
        uid TEXT NOT NULL,
        date TEXT NOT NULL,
        api_calls INTEGER NOT NULL DEFAULT 0,
        total_spend REAL NOT NULL DEFAULT 0,
        lockout TEXT,
        admin_alerted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (uid, date)
    );

    CREATE TABLE IF NOT EXISTS refunds (
        consumption_id TEXT PRIMARY KEY,
        uid TEXT NOT NULL,
        refunded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_usage_date
        ON daily_usage(uid, date DESC);
"#;

/// SQLite connection guarded by a mutex
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) `credits.db` inside `dir`
    pub fn open_in_dir(dir: &Path) -> CreditResult<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(DB_FILENAME))
    }

    pub fn open(path: &Path) -> CreditResult<Self> {
        let conn = Connection::open(path)?;
        debug!(path = ?path, "Opened credits database");
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> CreditResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CreditResult<Self> {
        // Other processes may hold the write lock on a shared data dir
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned mutex
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned: PoisonError<MutexGuard<'_, Connection>>| {
                warn!("Database mutex was poisoned, recovering connection");
                poisoned.into_inner()
            })
    }

    pub fn default_path(dir: &Path) -> PathBuf {
        dir.join(DB_FILENAME)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
