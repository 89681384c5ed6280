//! Persistence collaborators for zones and settings.
//!
//! The core always writes the full zone set, never deltas, so every
//! implementation is idempotent by construction.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::model::Zone;
use crate::core::error::PersistenceError;

/// Flat key/value settings as handed to storage.
pub type SettingsMap = BTreeMap<String, serde_json::Value>;

pub trait Persistence: Send + Sync {
    fn save_zones(&self, zones: &[Zone]) -> Result<(), PersistenceError>;
    fn load_zones(&self) -> Result<Vec<Zone>, PersistenceError>;
    fn save_settings(&self, settings: &SettingsMap) -> Result<(), PersistenceError>;
    fn load_settings(&self) -> Result<SettingsMap, PersistenceError>;
}

/// Stores `zones.json` and `settings.json` in a data directory.
pub struct JsonFilePersistence {
    data_dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn zones_path(&self) -> PathBuf {
        self.data_dir.join("zones.json")
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    fn write_json<T: serde::Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.data_dir)?;
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl Persistence for JsonFilePersistence {
    fn save_zones(&self, zones: &[Zone]) -> Result<(), PersistenceError> {
        self.write_json(&self.zones_path(), zones)
    }

    /// Entries that fail to parse are logged and skipped, so one bad record
    /// does not lose the rest of the set.
    fn load_zones(&self) -> Result<Vec<Zone>, PersistenceError> {
        let path = self.zones_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let raw: Vec<serde_json::Value> = serde_json::from_str(&content)?;

        let mut zones = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<Zone>(value) {
                Ok(zone) => zones.push(zone),
                Err(e) => log::warn!("Skipping unreadable zone #{} in {:?}: {}", index, path, e),
            }
        }
        Ok(zones)
    }

    fn save_settings(&self, settings: &SettingsMap) -> Result<(), PersistenceError> {
        self.write_json(&self.settings_path(), settings)
    }

    fn load_settings(&self) -> Result<SettingsMap, PersistenceError> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(SettingsMap::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// In-memory storage for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryPersistence {
    zones: Mutex<Vec<Zone>>,
    settings: Mutex<SettingsMap>,
    zone_saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zones(zones: Vec<Zone>) -> Self {
        let store = Self::new();
        *store.zones.lock().unwrap_or_else(|e| e.into_inner()) = zones;
        store
    }

    /// Number of successful `save_zones` calls.
    pub fn zone_saves(&self) -> usize {
        self.zone_saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("storage offline".to_string()));
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn save_zones(&self, zones: &[Zone]) -> Result<(), PersistenceError> {
        self.check()?;
        *self.zones.lock().unwrap_or_else(|e| e.into_inner()) = zones.to_vec();
        self.zone_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_zones(&self) -> Result<Vec<Zone>, PersistenceError> {
        self.check()?;
        Ok(self.zones.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_settings(&self, settings: &SettingsMap) -> Result<(), PersistenceError> {
        self.check()?;
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        Ok(())
    }

    fn load_settings(&self) -> Result<SettingsMap, PersistenceError> {
        self.check()?;
        Ok(self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
