use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::alerts::engine::EvaluatorConfig;
use super::error::PersistenceError;
use super::location::controller::LocationConfig;
use super::zones::persist::{Persistence, SettingsMap};

/// Save and sweep cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Quiet period before a changed zone set is written (default: 500ms)
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    /// Expiry check interval while no samples arrive (default: 30s)
    #[serde(default = "default_expiry_sweep_secs")]
    pub expiry_sweep_secs: u64,
}

fn default_save_debounce_ms() -> u64 {
    500
}

fn default_expiry_sweep_secs() -> u64 {
    30
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: default_save_debounce_ms(),
            expiry_sweep_secs: default_expiry_sweep_secs(),
        }
    }
}

/// Application settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub evaluation: EvaluatorConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

const EVALUATION_KEY: &str = "evaluation";
const LOCATION_KEY: &str = "location";
const PERSISTENCE_KEY: &str = "persistence";

impl Settings {
    /// One map entry per section.
    pub fn to_map(&self) -> SettingsMap {
        let mut map = SettingsMap::new();
        map.insert(EVALUATION_KEY.to_string(), to_value(&self.evaluation));
        map.insert(LOCATION_KEY.to_string(), to_value(&self.location));
        map.insert(PERSISTENCE_KEY.to_string(), to_value(&self.persistence));
        map
    }

    /// Missing or malformed sections fall back to their defaults.
    pub fn from_map(map: &SettingsMap) -> Self {
        Self {
            evaluation: section(map, EVALUATION_KEY),
            location: section(map, LOCATION_KEY),
            persistence: section(map, PERSISTENCE_KEY),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn section<T: Default + for<'de> Deserialize<'de>>(map: &SettingsMap, key: &str) -> T {
    match map.get(key) {
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed '{}' settings: {}", key, e);
            T::default()
        }),
        None => T::default(),
    }
}

pub struct ConfigManager {
    persistence: Arc<dyn Persistence>,
}

impl ConfigManager {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    pub fn load(&self) -> Settings {
        match self.persistence.load_settings() {
            Ok(map) => Settings::from_map(&map),
            Err(e) => {
                log::warn!("Could not load settings, using defaults: {}", e);
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), PersistenceError> {
        self.persistence.save_settings(&settings.to_map())
    }
}
