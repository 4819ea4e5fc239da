//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChatSettings::default()`]
//! 2. If `~/.colloquy/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `COLLOQUY_*` environment variable overrides (highest priority)
//!
//! Persisted preferences (selected model, edited model list) are layered on
//! afterwards by the store crate.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ChatSettings;

pub const ENV_DEFAULT_MODEL: &str = "COLLOQUY_DEFAULT_MODEL";
pub const ENV_DEFAULT_KEY: &str = "COLLOQUY_DEFAULT_KEY";
pub const ENV_CONTEXT_COUNT: &str = "COLLOQUY_CONTEXT_COUNT";
pub const ENV_SEARCH_ENABLED: &str = "COLLOQUY_SEARCH_ENABLED";
pub const ENV_SEARCH_TOKEN: &str = "COLLOQUY_SEARCH_TOKEN";
pub const ENV_DATA_DIR: &str = "COLLOQUY_DATA_DIR";

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `~/.colloquy/settings.json`
pub fn settings_path() -> PathBuf {
    home_dir().join(".colloquy").join("settings.json")
}

/// Directory for the conversation database: `dataDir` when set, otherwise
/// `~/.colloquy`.
pub fn data_dir(settings: &ChatSettings) -> PathBuf {
    if settings.data_dir.is_empty() {
        home_dir().join(".colloquy")
    } else {
        PathBuf::from(&settings.data_dir)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChatSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChatSettings> {
    let defaults = serde_json::to_value(ChatSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChatSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COLLOQUY_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut ChatSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source. Invalid values are
/// logged and ignored.
pub fn apply_overrides<F>(settings: &mut ChatSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = string(ENV_DEFAULT_MODEL) {
        settings.default_model = v;
    }
    if let Some(v) = string(ENV_DEFAULT_KEY) {
        settings.default_key = v;
    }
    if let Some(raw) = lookup(ENV_CONTEXT_COUNT) {
        match parse_usize_range(&raw, 1, 1000) {
            Some(v) => settings.context_count = v,
            None => warn!(key = ENV_CONTEXT_COUNT, value = %raw, "invalid usize env var, ignoring"),
        }
    }
    if let Some(raw) = lookup(ENV_SEARCH_ENABLED) {
        match parse_bool(&raw) {
            Some(v) => settings.search.enabled = v,
            None => warn!(key = ENV_SEARCH_ENABLED, value = %raw, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = string(ENV_SEARCH_TOKEN) {
        settings.search.token = v;
    }
    if let Some(v) = string(ENV_DATA_DIR) {
        settings.data_dir = v;
    }
}

/// Reject values no code path can work with.
pub fn validate(settings: &ChatSettings) -> Result<()> {
    if settings.context_count == 0 {
        return Err(SettingsError::InvalidValue(
            "contextCount must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
