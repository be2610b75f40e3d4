//! Versioned JSON settings store shared by every module.
//!
//! On load the file is normalized (a legacy bare module map becomes a v0
//! wrapper), migrated one version at a time up to
//! [`CURRENT_SETTINGS_VERSION`], and re-persisted. Modules register a
//! default value once at startup; reads hand out deep clones so no caller
//! can mutate another module's view.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::atomic::write_atomic;

pub const CURRENT_SETTINGS_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    settings_version: u32,
    modules: Map<String, Value>,
}

#[derive(Debug)]
pub struct Settings {
    path: PathBuf,
    inner: Mutex<SettingsFile>,
}

impl Settings {
    /// Read, normalize, and migrate the settings file, then persist the
    /// result. Unreadable files regenerate defaults rather than failing.
    pub async fn load(state_dir: &Path) -> Result<Self, SettingsError> {
        let path = state_dir.join(crate::config::SETTINGS_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(error = %err, "settings file unreadable, regenerating");
                    None
                }
            },
            Err(_) => None,
        };

        let mut file = normalize(raw);
        let from = file.settings_version;
        migrate(&mut file);
        if from != file.settings_version {
            info!(from, to = file.settings_version, "settings migrated");
        }

        let settings = Self {
            path,
            inner: Mutex::new(file),
        };
        settings.persist().await?;
        Ok(settings)
    }

    /// Register a module default. Missing modules are inserted whole;
    /// existing object modules are overlaid with any missing default keys.
    pub async fn register_module(&self, name: &str, default: Value) -> Result<(), SettingsError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.modules.get_mut(name) {
                None => {
                    inner.modules.insert(name.to_string(), default);
                }
                Some(existing) => overlay_defaults(existing, &default),
            }
        }
        self.persist().await
    }

    /// Deep clone of a module's value; `Null` when never registered.
    pub async fn module(&self, name: &str) -> Value {
        let inner = self.inner.lock().await;
        inner.modules.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Replace a module's value and persist.
    pub async fn update_module(&self, name: &str, value: Value) -> Result<(), SettingsError> {
        {
            let mut inner = self.inner.lock().await;
            inner.modules.insert(name.to_string(), value);
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<(), SettingsError> {
        let bytes = {
            let inner = self.inner.lock().await;
            serde_json::to_vec_pretty(&*inner)?
        };
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

/// Shape the raw file into the versioned wrapper. A file with no
/// `settingsVersion` is treated as a v0 bare module map.
fn normalize(raw: Option<Value>) -> SettingsFile {
    match raw {
        Some(Value::Object(map)) => {
            if let Some(version) = map.get("settingsVersion").and_then(Value::as_u64) {
                let modules = match map.get("modules") {
                    Some(Value::Object(modules)) => modules.clone(),
                    _ => Map::new(),
                };
                SettingsFile {
                    settings_version: version as u32,
                    modules,
                }
            } else {
                SettingsFile {
                    settings_version: 0,
                    modules: map,
                }
            }
        }
        _ => SettingsFile {
            settings_version: 0,
            modules: Map::new(),
        },
    }
}

fn migrate(file: &mut SettingsFile) {
    while file.settings_version < CURRENT_SETTINGS_VERSION {
        match file.settings_version {
            0 => migrate_v0_to_v1(file),
            1 => migrate_v1_to_v2(file),
            _ => break,
        }
        file.settings_version += 1;
    }
    file.settings_version = CURRENT_SETTINGS_VERSION;
}

/// v0 files used the module key `upload`; v1 renamed it to `uploads`.
fn migrate_v0_to_v1(file: &mut SettingsFile) {
    if let Some(value) = file.modules.remove("upload") {
        file.modules.entry("uploads".to_string()).or_insert(value);
    }
}

/// v1 carried the full upstream haproxy block; v2 keeps only the
/// proxy-protocol toggle.
fn migrate_v1_to_v2(file: &mut SettingsFile) {
    let enabled = file
        .modules
        .get("haproxy")
        .and_then(|value| {
            value
                .get("proxyProtocolV2")
                .or_else(|| value.get("enabled"))
        })
        .and_then(Value::as_bool)
        .unwrap_or(false);
    file.modules
        .insert("haproxy".to_string(), json!({ "proxyProtocolV2": enabled }));
}

fn overlay_defaults(existing: &mut Value, default: &Value) {
    if let (Value::Object(existing), Value::Object(default)) = (existing, default) {
        for (key, value) in default {
            existing.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}
