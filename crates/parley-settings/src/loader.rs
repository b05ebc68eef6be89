use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::{BackendKind, ParleySettings};

/// `$PARLEY_HOME/settings.json`, falling back to `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Ok(home) = std::env::var("PARLEY_HOME") {
        return PathBuf::from(home).join("settings.json");
    }
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
        .join("settings.json")
}

/// Load settings from the default path with env overrides applied.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let file = match std::fs::read_to_string(path) {
        Ok(raw) => Some(serde_json::from_str::<Value>(&raw).map_err(|source| {
            SettingsError::Json {
                path: path.to_path_buf(),
                source,
            }
        })?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(?path, "no settings file, using defaults");
            None
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    resolve(file, |var| std::env::var(var).ok())
}

/// Merge `file` over the compiled defaults, then apply env overrides read
/// through `lookup`.
pub fn resolve(
    file: Option<Value>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ParleySettings> {
    let mut merged = serde_json::to_value(ParleySettings::default())?;
    if let Some(file) = file {
        merged = deep_merge(merged, file);
    }
    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, lookup)?;
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value replaces the base value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

fn apply_env_overrides(
    settings: &mut ParleySettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = lookup("PARLEY_BACKEND") {
        settings.backend.kind = value
            .parse::<BackendKind>()
            .map_err(|_| SettingsError::InvalidEnv {
                var: "PARLEY_BACKEND",
                value,
            })?;
    }
    if let Some(value) = lookup("PARLEY_BASE_URL") {
        settings.backend.base_url = value;
    }
    if let Some(value) = lookup("PARLEY_MODEL") {
        settings.backend.model = value;
    }
    if let Some(value) = lookup("PARLEY_TEMPERATURE") {
        let temperature = value
            .parse::<f64>()
            .map_err(|_| SettingsError::InvalidEnv {
                var: "PARLEY_TEMPERATURE",
                value,
            })?;
        settings.generation.temperature = Some(temperature);
    }
    if let Some(value) = lookup("PARLEY_LOG_LEVEL") {
        settings.logging.level = value;
    }
    Ok(())
}
