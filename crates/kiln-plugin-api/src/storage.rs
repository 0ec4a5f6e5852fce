//! Versioned, checksummed per-plugin storage.
//!
//! Each key is stored as three files in the plugin's data directory:
//!
//! ```text
//! <key>.json      pretty-printed value
//! <key>.version   schema version (decimal)
//! <key>.sha256    hex digest of <key>.json
//! ```
//!
//! Before a save overwrites them, the current files are copied to `*.bak`.
//! Every write goes to a temp file first and is renamed into place. A load
//! whose checksum does not match falls back to the backup and restores it.

use kiln_runtime::{RuntimeError, RuntimeResult};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

static KEY_RE: OnceLock<Regex> = OnceLock::new();

fn key_re() -> &'static Regex {
    KEY_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]{0,63}$").expect("valid key regex"))
}

/// Entry point to one plugin's storage directory.
#[derive(Debug, Clone)]
pub struct StorageProvider {
    plugin_id: String,
    root: PathBuf,
}

impl StorageProvider {
    pub fn new(plugin_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            root: root.into(),
        }
    }

    /// The plugin's data directory. Plugins may keep their own files here.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a typed store for `key` at schema `version`.
    pub fn store<T>(&self, key: &str, version: u32) -> RuntimeResult<PersistentStore<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        if !key_re().is_match(key) {
            return Err(RuntimeError::Storage(format!(
                "plugin '{}': invalid storage key '{}'",
                self.plugin_id, key
            )));
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(PersistentStore {
            dir: self.root.clone(),
            key: key.to_string(),
            version,
            _marker: PhantomData,
        })
    }

    /// Keys that currently have a value on disk.
    pub fn keys(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .filter(|k| key_re().is_match(k))
            .collect();
        keys.sort();
        keys
    }

    /// Delete a key and its backups. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> RuntimeResult<bool> {
        if !key_re().is_match(key) {
            return Ok(false);
        }
        let mut removed = false;
        for suffix in ["json", "version", "sha256"] {
            for name in [format!("{key}.{suffix}"), format!("{key}.{suffix}.bak")] {
                match std::fs::remove_file(self.root.join(name)) {
                    Ok(()) => removed = true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

/// A single typed value with a schema version.
#[derive(Debug)]
pub struct PersistentStore<T> {
    dir: PathBuf,
    key: String,
    version: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PersistentStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Schema version this store writes.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Load the stored value, or `None` when nothing has been saved yet.
    pub fn load(&self) -> RuntimeResult<Option<T>> {
        match self.load_raw()? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and persist `value` at this store's version.
    pub fn save(&self, value: &T) -> RuntimeResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_files(&json, self.version)
    }

    /// Schema version on disk. Data without a version file counts as version 0.
    pub fn stored_version(&self) -> RuntimeResult<Option<u32>> {
        if !self.path("json").exists() && !self.backup("json").exists() {
            return Ok(None);
        }
        match std::fs::read_to_string(self.path("version")) {
            Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
                RuntimeError::Storage(format!("{}: unreadable version '{}'", self.key, raw.trim()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Some(0)),
            Err(e) => Err(e.into()),
        }
    }

    /// Upgrade stored data written at `from_version`.
    ///
    /// Runs only when the stored version equals `from_version` and is older
    /// than this store's version. The migrated value must deserialize as `T`;
    /// it is then saved at the current version. Returns whether it ran.
    pub fn migrate<F>(&self, from_version: u32, migration: F) -> RuntimeResult<bool>
    where
        F: FnOnce(serde_json::Value) -> anyhow::Result<serde_json::Value>,
    {
        let stored = match self.stored_version()? {
            Some(v) => v,
            None => return Ok(false),
        };
        if stored != from_version || stored >= self.version {
            return Ok(false);
        }
        let Some(raw) = self.load_raw()? else {
            return Ok(false);
        };

        let migrated = migration(raw).map_err(|e| {
            RuntimeError::Storage(format!(
                "{}: migration from v{} failed: {}",
                self.key, from_version, e
            ))
        })?;
        let value: T = serde_json::from_value(migrated)?;
        self.save(&value)?;
        debug!("Migrated storage key {} from v{} to v{}", self.key, from_version, self.version);
        Ok(true)
    }

    fn load_raw(&self) -> RuntimeResult<Option<serde_json::Value>> {
        let main = self.path("json");
        if !main.exists() {
            if self.backup("json").exists() {
                warn!("Storage key {} missing, restoring backup", self.key);
                return self.restore_backup().map(Some);
            }
            return Ok(None);
        }

        let bytes = std::fs::read(&main)?;
        if self.checksum_matches(&bytes, &self.path("sha256"))? {
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        warn!("Storage key {} failed checksum, trying backup", self.key);
        self.restore_backup().map(Some)
    }

    fn restore_backup(&self) -> RuntimeResult<serde_json::Value> {
        let bytes = std::fs::read(self.backup("json")).map_err(|_| {
            RuntimeError::Storage(format!("{}: checksum mismatch and no backup", self.key))
        })?;
        if !self.checksum_matches(&bytes, &self.backup("sha256"))? {
            return Err(RuntimeError::Storage(format!(
                "{}: checksum mismatch in data and backup",
                self.key
            )));
        }

        let version = std::fs::read_to_string(self.backup("version"))
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let json = String::from_utf8(bytes)
            .map_err(|_| RuntimeError::Storage(format!("{}: backup is not UTF-8", self.key)))?;
        let value = serde_json::from_str(&json)?;
        self.write_atomic(&self.path("json"), json.as_bytes())?;
        self.write_atomic(&self.path("version"), version.to_string().as_bytes())?;
        self.write_atomic(&self.path("sha256"), digest(json.as_bytes()).as_bytes())?;
        Ok(value)
    }

    /// A missing checksum file is accepted (data written by hand).
    fn checksum_matches(&self, bytes: &[u8], checksum_path: &Path) -> RuntimeResult<bool> {
        match std::fs::read_to_string(checksum_path) {
            Ok(expected) => Ok(expected.trim().eq_ignore_ascii_case(&digest(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn write_files(&self, json: &str, version: u32) -> RuntimeResult<()> {
        for suffix in ["json", "version", "sha256"] {
            let current = self.path(suffix);
            if current.exists() {
                std::fs::copy(&current, self.backup(suffix))?;
            }
        }
        self.write_atomic(&self.path("json"), json.as_bytes())?;
        self.write_atomic(&self.path("version"), version.to_string().as_bytes())?;
        self.write_atomic(&self.path("sha256"), digest(json.as_bytes()).as_bytes())?;
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> RuntimeResult<()> {
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("data")
        ));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.key, suffix))
    }

    fn backup(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.bak", self.key, suffix))
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Balances {
        accounts: Vec<(String, i64)>,
    }

    fn provider(dir: &TempDir) -> StorageProvider {
        StorageProvider::new("economy", dir.path().join("economy"))
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = provider(&temp_dir).store::<Balances>("balances", 1).unwrap();

        assert_eq!(store.load().unwrap(), None);
        assert_eq!(store.stored_version().unwrap(), None);

        let value = Balances {
            accounts: vec![("alex".into(), 10)],
        };
        store.save(&value).unwrap();
        assert_eq!(store.load().unwrap(), Some(value));
        assert_eq!(store.stored_version().unwrap(), Some(1));
        assert_eq!(provider(&temp_dir).keys(), vec!["balances".to_string()]);
    }

    #[test]
    fn test_corrupt_data_restored_from_backup() {
        let temp_dir = TempDir::new().unwrap();
        let storage = provider(&temp_dir);
        let store = storage.store::<Balances>("balances", 1).unwrap();

        let first = Balances {
            accounts: vec![("alex".into(), 10)],
        };
        let second = Balances {
            accounts: vec![("alex".into(), 20)],
        };
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        std::fs::write(storage.root().join("balances.json"), "{\"accounts\":[]}").unwrap();

        assert_eq!(store.load().unwrap(), Some(first));
        // The restored copy now passes its checksum.
        let bytes = std::fs::read(storage.root().join("balances.json")).unwrap();
        let checksum = std::fs::read_to_string(storage.root().join("balances.sha256")).unwrap();
        assert_eq!(checksum, digest(&bytes));
    }

    #[test]
    fn test_corrupt_without_backup_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = provider(&temp_dir);
        let store = storage.store::<Balances>("balances", 1).unwrap();
        store.save(&Balances { accounts: vec![] }).unwrap();

        std::fs::write(storage.root().join("balances.json"), "{\"accounts\":[[\"x\",1]]}").unwrap();
        assert!(matches!(store.load(), Err(RuntimeError::Storage(_))));
    }

    #[test]
    fn test_migrate() {
        let temp_dir = TempDir::new().unwrap();
        let storage = provider(&temp_dir);

        let v1 = storage.store::<serde_json::Value>("balances", 1).unwrap();
        v1.save(&serde_json::json!({ "alex": 10 })).unwrap();

        let v2 = storage.store::<Balances>("balances", 2).unwrap();
        assert!(!v2.migrate(0, |v| Ok(v)).unwrap());

        let migrated = v2
            .migrate(1, |old| {
                let accounts: Vec<(String, i64)> = old
                    .as_object()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(0))).collect())
                    .unwrap_or_default();
                Ok(serde_json::json!({ "accounts": accounts }))
            })
            .unwrap();
        assert!(migrated);
        assert_eq!(v2.stored_version().unwrap(), Some(2));
        assert_eq!(
            v2.load().unwrap(),
            Some(Balances {
                accounts: vec![("alex".into(), 10)]
            })
        );

        // Already at the current version.
        assert!(!v2.migrate(1, |v| Ok(v)).unwrap());
    }

    #[test]
    fn test_invalid_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = provider(&temp_dir);
        assert!(storage.store::<i32>("../escape", 1).is_err());
        assert!(storage.store::<i32>("..", 1).is_err());
        assert!(storage.store::<i32>("", 1).is_err());
        assert!(storage.store::<i32>("ok.key", 1).is_ok());
    }

    #[test]
    fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = provider(&temp_dir);
        let store = storage.store::<i32>("counter", 1).unwrap();
        store.save(&1).unwrap();
        store.save(&2).unwrap();

        assert!(storage.delete("counter").unwrap());
        assert!(storage.keys().is_empty());
        assert_eq!(store.load().unwrap(), None);
        assert!(!storage.delete("counter").unwrap());
    }
}
