//! Settings collaborator.
//!
//! The runtime never owns settings persistence. It talks to a
//! [`SettingsStore`] through `get`/`set`/`get_all`, always inside a section
//! derived from the script id (see [`crate::bridge::settings`]).
//!
//! Two implementations ship with the crate: [`MemorySettings`] for tests and
//! embedders that persist elsewhere, and [`JsonFileSettings`] which keeps a
//! cached copy of a single JSON file and rewrites it atomically on `set`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::script::store::write_atomic;

/// `section -> key -> value`.
pub type SettingsMap = BTreeMap<String, BTreeMap<String, String>>;

/// Key/value store partitioned into sections.
pub trait SettingsStore: Send + Sync {
    /// Read one value.
    fn get(&self, section: &str, key: &str) -> Result<Option<String>>;
    /// Write one value. `None` removes the key.
    fn set(&self, section: &str, key: &str, value: Option<&str>) -> Result<()>;
    /// Snapshot of every section.
    fn get_all(&self) -> Result<SettingsMap>;
}

fn apply(map: &mut SettingsMap, section: &str, key: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            map.entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        None => {
            if let Some(entries) = map.get_mut(section) {
                entries.remove(key);
                if entries.is_empty() {
                    map.remove(section);
                }
            }
        }
    }
}

/// In-process settings store.
#[derive(Debug, Default)]
pub struct MemorySettings {
    map: Mutex<SettingsMap>,
}

impl MemorySettings {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        let map = self.map.lock().expect("MemorySettings mutex poisoned");
        Ok(map.get(section).and_then(|s| s.get(key)).cloned())
    }

    fn set(&self, section: &str, key: &str, value: Option<&str>) -> Result<()> {
        let mut map = self.map.lock().expect("MemorySettings mutex poisoned");
        apply(&mut map, section, key, value);
        Ok(())
    }

    fn get_all(&self) -> Result<SettingsMap> {
        Ok(self.map.lock().expect("MemorySettings mutex poisoned").clone())
    }
}

/// Settings persisted to one JSON file.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    cache: Mutex<SettingsMap>,
}

impl JsonFileSettings {
    /// Load `path` if it exists; the file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse settings {}", path.display()))?
        } else {
            SettingsMap::new()
        };
        Ok(Self {
            path,
            cache: Mutex::new(map),
        })
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        let map = self.cache.lock().expect("JsonFileSettings mutex poisoned");
        Ok(map.get(section).and_then(|s| s.get(key)).cloned())
    }

    fn set(&self, section: &str, key: &str, value: Option<&str>) -> Result<()> {
        let mut map = self.cache.lock().expect("JsonFileSettings mutex poisoned");
        let mut next = map.clone();
        apply(&mut next, section, key, value);
        write_atomic(&self.path, &serde_json::to_string_pretty(&next)?)?;
        *map = next;
        Ok(())
    }

    fn get_all(&self) -> Result<SettingsMap> {
        Ok(self
            .cache
            .lock()
            .expect("JsonFileSettings mutex poisoned")
            .clone())
    }
}
