//! Per-model and per-category configuration.

use serde::{Deserialize, Serialize};

/// Whether a model emits a separate reasoning channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Thinking,
    #[default]
    Normal,
}

/// One configured chat model, keyed by its request id in
/// [`ChatSettings::models`](super::ChatSettings).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Display name.
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ModelKind,
    pub url: String,
    /// API key. Empty or `"none"` means "use the default key".
    #[serde(default)]
    pub key: String,
}

impl ModelConfig {
    pub fn new(name: &str, kind: ModelKind, url: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            url: url.to_string(),
            key: "none".to_string(),
        }
    }

    pub fn has_own_key(&self) -> bool {
        !self.key.is_empty() && self.key != "none"
    }
}

/// A conversation category with its preset system prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatType {
    pub name: String,
    pub system_prompt: String,
}

impl ChatType {
    pub fn new(name: &str, system_prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
        }
    }
}
