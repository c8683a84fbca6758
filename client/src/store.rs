//! Key-value persistence with optional expiry.

use crate::error::{Result, SearchError};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Opaque get/set-with-expiry storage. Expired entries read as absent.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Json>>;
    fn set(&self, key: &str, value: Json, expiry: Option<Duration>) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    value: Json,
    /// Unix seconds; `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl Entry {
    fn new(value: Json, expiry: Option<Duration>) -> Self {
        let expires_at = expiry.map(|ttl| now_unix() + ttl.as_secs() as i64);
        Self { value, expires_at }
    }

    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// In-process store, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Json>> {
        let mut entries = self.entries.borrow_mut();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now_unix()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Json, expiry: Option<Duration>) -> Result<()> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), Entry::new(value, expiry));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// Whole-file JSON store. Every write rewrites the file, pruning expired entries.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RefCell<BTreeMap<String, Entry>>,
}

impl JsonFileStore {
    /// Load from disk, or start empty if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                SearchError::Store(format!("Failed to read store from {:?}: {}", path, e))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                SearchError::Store(format!("Failed to parse store from {:?}: {}", path, e))
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: RefCell::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let now = now_unix();
        let mut entries = self.entries.borrow_mut();
        entries.retain(|_, entry| !entry.is_expired(now));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SearchError::Store(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }
        let content = serde_json::to_string_pretty(&*entries)?;
        std::fs::write(&self.path, content).map_err(|e| {
            SearchError::Store(format!("Failed to write store to {:?}: {}", self.path, e))
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Json>> {
        let entries = self.entries.borrow();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_unix()))
            .map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: Json, expiry: Option<Duration>) -> Result<()> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), Entry::new(value, expiry));
        self.save()
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = self.entries.borrow_mut().remove(key).is_some();
        if removed {
            self.save()?;
        }
        Ok(())
    }
}
