//! # colloquy-settings
//!
//! Layered configuration for the chat client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`ChatSettings::default()`])
//! 2. **User file** at `~/.colloquy/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `COLLOQUY_*` overrides (highest priority)
//!
//! [`ModelRegistry`] turns the configured model map into request endpoints.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod registry;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, data_dir, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use registry::ModelRegistry;
pub use types::*;
