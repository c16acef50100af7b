//! Key-value settings capability.
//!
//! The link persists two values across sessions: the identity of the last
//! successfully connected device and the authentication secret. Both are
//! read and written through [`KeyValueStore`], which the host application
//! provides. [`MemoryStore`] and [`FileStore`] cover tests and desktop use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

/// Key holding the id of the last connected device.
pub const LAST_DEVICE_KEY: &str = "lastDeviceUUID";

/// Key holding the authentication secret.
pub const PASSPHRASE_KEY: &str = "passphrase";

/// Key holding the user-facing device name setting.
pub const DEVICE_NAME_KEY: &str = "settingDeviceName";

/// A simple string key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with values.
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|e| Error::Store(e.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|e| Error::Store(e.to_string()))?;
        values.remove(key);
        Ok(())
    }
}

/// Store backed by a TOML file of string values.
///
/// The file is read once on open and rewritten after every mutation.
/// A missing file is treated as an empty store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = values.len(), "Opened settings store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open the store at the default location.
    pub fn open_default() -> Result<Self> {
        Self::open(default_store_path())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let content = toml::to_string_pretty(values).map_err(|e| Error::Store(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|e| Error::Store(e.to_string()))?;
        let mut updated = values.clone();
        updated.insert(key.to_string(), value.to_string());
        self.persist(&updated)?;
        *values = updated;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|e| Error::Store(e.to_string()))?;
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut updated = values.clone();
        updated.remove(key);
        self.persist(&updated)?;
        *values = updated;
        Ok(())
    }
}

/// Default settings file path.
pub fn default_store_path() -> PathBuf {
    crate::config::default_config_dir().join("settings.toml")
}
