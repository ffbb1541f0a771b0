//! Persisted host state.
//!
//! Everything the host remembers between runs lives in one JSON document:
//! the selection, disabled plugins, calibration, bindings, tracker slots,
//! the language and each plugin's own settings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::calibration::CalibrationStore;
use crate::error::PluginError;
use crate::frame::TrackerSlot;
use crate::router::BindingRecord;
use crate::sync::{read, write};

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    #[serde(default)]
    pub base_device: Option<String>,
    #[serde(default)]
    pub override_devices: Vec<String>,
    #[serde(default)]
    pub service_endpoint: Option<String>,
    #[serde(default)]
    pub disabled_plugins: BTreeSet<String>,
    #[serde(default)]
    pub calibration: CalibrationStore,
    #[serde(default)]
    pub bindings: Vec<BindingRecord>,
    #[serde(default = "TrackerSlot::defaults")]
    pub trackers: Vec<TrackerSlot>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Settings each plugin wrote through its facade, keyed by plugin guid.
    #[serde(default)]
    pub plugin_settings: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            base_device: None,
            override_devices: Vec::new(),
            service_endpoint: None,
            disabled_plugins: BTreeSet::new(),
            calibration: CalibrationStore::default(),
            bindings: Vec::new(),
            trackers: TrackerSlot::defaults(),
            language: default_language(),
            plugin_settings: BTreeMap::new(),
        }
    }
}

/// Host state behind a lock, written back to disk on every change.
pub struct SettingsStore {
    path: Option<PathBuf>,
    state: RwLock<HostState>,
}

impl SettingsStore {
    /// Read the state file; a missing file yields the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no host state yet, using defaults");
                HostState::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A store that never touches the disk.
    pub fn in_memory(state: HostState) -> Self {
        Self {
            path: None,
            state: RwLock::new(state),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> HostState {
        read(&self.state).clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&HostState) -> R) -> R {
        f(&read(&self.state))
    }

    /// Mutate the state and persist it.
    pub fn update<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> Result<R, PluginError> {
        let (result, content) = {
            let mut state = write(&self.state);
            let result = f(&mut state);
            (result, serde_json::to_string_pretty(&*state)?)
        };
        self.persist(&content)?;
        Ok(result)
    }

    pub fn save(&self) -> Result<(), PluginError> {
        let content = serde_json::to_string_pretty(&*read(&self.state))?;
        self.persist(&content)
    }

    fn persist(&self, content: &str) -> Result<(), PluginError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    // ── Plugin settings ──────────────────────────────────────────────

    pub fn plugin_setting(&self, guid: &str, key: &str) -> Option<Value> {
        read(&self.state)
            .plugin_settings
            .get(guid)
            .and_then(|settings| settings.get(key))
            .cloned()
    }

    pub fn set_plugin_setting(&self, guid: &str, key: &str, value: Value) -> Result<(), PluginError> {
        if key.is_empty() {
            return Err(PluginError::InvalidSetting(
                "setting key must not be empty".into(),
            ));
        }
        self.update(|state| {
            state
                .plugin_settings
                .entry(guid.to_string())
                .or_default()
                .insert(key.to_string(), value);
        })
    }

    pub fn calibration(&self) -> CalibrationStore {
        read(&self.state).calibration.clone()
    }

    pub fn is_disabled(&self, guid: &str) -> bool {
        read(&self.state).disabled_plugins.contains(guid)
    }
}
