//! Client-local key-value storage
//!
//! A flat JSON object of string values persisted to a single file, the
//! durable equivalent of browser local storage. Writes hold an exclusive
//! file lock so two processes sharing a data dir do not clobber each other.

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::CreditResult;

const STORAGE_FILENAME: &str = "local_storage.json";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    path: PathBuf,
}

impl LocalStorage {
    /// Storage file inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(STORAGE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> CreditResult<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    pub fn set(&self, key: &str, value: &str) -> CreditResult<()> {
        self.update(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    pub fn remove(&self, key: &str) -> CreditResult<()> {
        self.update(|items| {
            items.remove(key);
        })
    }

    fn read_all(&self) -> CreditResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> CreditResult<()> {
        let _lock = self.acquire_lock()?;

        let mut items = self.read_all()?;
        f(&mut items);

        // Write to a temp file and rename so readers never see a partial file
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&items)?)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = ?self.path, keys = items.len(), "Saved local storage");
        Ok(())
    }

    /// Exclusive lock held for the lifetime of the returned handle
    fn acquire_lock(&self) -> CreditResult<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("lock"))?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::in_dir(dir.path());
        assert_eq!(storage.get("anything").unwrap(), None);
    }

    #[test]
    fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::in_dir(dir.path());

        storage.set("theme", "dark").unwrap();
        storage.set("godMode", "true").unwrap();
        assert_eq!(storage.get("theme").unwrap().as_deref(), Some("dark"));

        // A second handle sees the same file
        let other = LocalStorage::in_dir(dir.path());
        assert_eq!(other.get("godMode").unwrap().as_deref(), Some("true"));

        storage.remove("theme").unwrap();
        assert_eq!(other.get("theme").unwrap(), None);
        assert_eq!(other.get("godMode").unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::in_dir(dir.path());
        fs::write(storage.path(), "{not json").unwrap();
        assert!(storage.get("godMode").is_err());
    }
}
