//! System settings and per-module settings files
//!
//! A world carries one settings table, rebound on every play transition.
//! Module settings are reflected-struct dumps stored per library under
//! `Configuration/Modules/<library>/<name>.config`; a lazy mtime check
//! drives live reload.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ahash::AHashMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{EcsError, Result};

/// Settings table published to systems, keyed by module or system name.
/// Written once per play transition, read-only during ticks.
#[derive(Default, Clone)]
pub struct SystemSettings {
    entries: AHashMap<String, Value>,
}

impl SystemSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Deserialize a settings entry into a typed struct.
    pub fn get_typed<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .entries
            .get(name)
            .ok_or_else(|| EcsError::DeserializationError(format!("no settings bound for '{name}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|err| EcsError::DeserializationError(format!("settings '{name}': {err}")))
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// On-disk location of one settings file
pub fn settings_path(project_dir: &Path, library_name: &str, settings_name: &str) -> PathBuf {
    project_dir
        .join("Configuration")
        .join("Modules")
        .join(library_name)
        .join(format!("{settings_name}.config"))
}

/// A module's reflected settings blob plus its reload bookkeeping
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub settings_name: String,
    pub values: Value,
    path: PathBuf,
    last_write: Option<SystemTime>,
}

impl ModuleSettings {
    /// In-memory settings not yet backed by a file
    pub fn with_defaults(settings_name: impl Into<String>, defaults: Value) -> Self {
        Self {
            settings_name: settings_name.into(),
            values: defaults,
            path: PathBuf::new(),
            last_write: None,
        }
    }

    /// Load a settings file, or fall back to `defaults` when it is missing.
    /// A corrupt file is an io-failure surfaced to the caller.
    pub fn load_or_default(
        project_dir: &Path,
        library_name: &str,
        settings_name: &str,
        defaults: Value,
    ) -> Result<Self> {
        let path = settings_path(project_dir, library_name, settings_name);
        if !path.exists() {
            info!(
                library = library_name,
                settings = settings_name,
                "settings file missing, using defaults"
            );
            return Ok(Self {
                settings_name: settings_name.to_string(),
                values: defaults,
                path,
                last_write: None,
            });
        }
        let data = std::fs::read_to_string(&path)?;
        let values: Value = serde_json::from_str(&data).map_err(|err| {
            EcsError::DeserializationError(format!(
                "settings file '{}' is corrupt: {err}",
                path.display()
            ))
        })?;
        let last_write = std::fs::metadata(&path).and_then(|meta| meta.modified()).ok();
        Ok(Self {
            settings_name: settings_name.to_string(),
            values: merge_missing_fields(values, defaults),
            path,
            last_write,
        })
    }

    /// Persist the current values, creating the directory chain on demand.
    pub fn save(&mut self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(EcsError::IoError(
                "settings were never bound to a file".to_string(),
            ));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.values)
            .map_err(|err| EcsError::SerializationError(err.to_string()))?;
        std::fs::write(&self.path, data)?;
        self.last_write = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        Ok(())
    }

    /// True when the on-disk file is newer than what was loaded.
    pub fn is_stale(&self) -> bool {
        let Ok(modified) = std::fs::metadata(&self.path).and_then(|meta| meta.modified()) else {
            return false;
        };
        match self.last_write {
            Some(last) => modified > last,
            None => true,
        }
    }

    /// Reload from disk when the file changed. Missing fields keep their
    /// previous values through the default-merge. Returns whether a reload
    /// happened.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        if self.path.as_os_str().is_empty() || !self.path.exists() || !self.is_stale() {
            return Ok(false);
        }
        let data = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Value>(&data) {
            Ok(values) => {
                self.values = merge_missing_fields(values, self.values.clone());
                self.last_write = std::fs::metadata(&self.path)
                    .and_then(|meta| meta.modified())
                    .ok();
                info!(settings = self.settings_name.as_str(), "settings reloaded");
                Ok(true)
            }
            Err(err) => {
                warn!(
                    settings = self.settings_name.as_str(),
                    error = %err,
                    "settings file changed but is corrupt, keeping previous values"
                );
                Err(EcsError::DeserializationError(err.to_string()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fill fields absent from `values` with their counterpart in `defaults`.
/// The default-initialisation path for fields that went missing on disk.
fn merge_missing_fields(values: Value, defaults: Value) -> Value {
    match (values, defaults) {
        (Value::Object(mut map), Value::Object(default_map)) => {
            for (key, default_value) in default_map {
                if !map.contains_key(&key) {
                    map.insert(key, default_value);
                }
            }
            Value::Object(map)
        }
        (values, _) => values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("forge_ecs_settings_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_bind_and_typed_get() {
        let mut settings = SystemSettings::new();
        settings.bind("physics", json!({ "gravity": -9.81, "substeps": 4 }));

        #[derive(serde::Deserialize)]
        struct Physics {
            gravity: f64,
            substeps: u32,
        }
        let physics: Physics = settings.get_typed("physics").unwrap();
        assert_eq!(physics.substeps, 4);
        assert!(physics.gravity < 0.0);
        assert!(settings.get_typed::<Physics>("render").is_err());
    }

    #[test]
    fn test_settings_path_layout() {
        let path = settings_path(Path::new("/project"), "physics_module", "Default");
        assert_eq!(
            path,
            Path::new("/project/Configuration/Modules/physics_module/Default.config")
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = scratch_dir("round_trip");
        let defaults = json!({ "speed": 1.0 });
        let mut settings =
            ModuleSettings::load_or_default(&dir, "movement", "Default", defaults.clone()).unwrap();
        settings.values = json!({ "speed": 2.5 });
        settings.save().unwrap();

        let reloaded = ModuleSettings::load_or_default(&dir, "movement", "Default", defaults).unwrap();
        assert_eq!(reloaded.values["speed"], json!(2.5));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let dir = scratch_dir("merge");
        let path = settings_path(&dir, "render", "Default");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{ "width": 800 }"#).unwrap();

        let defaults = json!({ "width": 1280, "height": 720 });
        let settings = ModuleSettings::load_or_default(&dir, "render", "Default", defaults).unwrap();
        assert_eq!(settings.values["width"], json!(800));
        assert_eq!(settings.values["height"], json!(720));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_settings_is_io_failure() {
        let dir = scratch_dir("corrupt");
        let path = settings_path(&dir, "audio", "Default");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json {").unwrap();

        let result = ModuleSettings::load_or_default(&dir, "audio", "Default", json!({}));
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
