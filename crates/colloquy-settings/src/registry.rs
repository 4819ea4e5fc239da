//! Resolution of configured model ids into request endpoints.

use std::collections::BTreeMap;

use colloquy_core::provider::ModelEndpoint;

use crate::types::{ChatSettings, ModelConfig};

/// Snapshot of the configured models plus the fallback key.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelConfig>,
    default_url: String,
    default_key: String,
}

impl ModelRegistry {
    pub fn from_settings(settings: &ChatSettings) -> Self {
        Self {
            models: settings.models.clone(),
            default_url: settings.default_url.clone(),
            default_key: settings.default_key.clone(),
        }
    }

    /// Endpoint for `id`, or `None` when no such model is configured.
    /// A model without its own key borrows the default key; one without a
    /// URL borrows the default URL.
    pub fn resolve(&self, id: &str) -> Option<ModelEndpoint> {
        let cfg = self.models.get(id)?;
        let key = if cfg.has_own_key() {
            cfg.key.clone()
        } else {
            self.default_key.clone()
        };
        let url = if cfg.url.is_empty() {
            self.default_url.clone()
        } else {
            cfg.url.clone()
        };
        Some(ModelEndpoint::new(id, cfg.name.clone(), url, key))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// `(id, config)` pairs in id order.
    pub fn list(&self) -> impl Iterator<Item = (&str, &ModelConfig)> {
        self.models.iter().map(|(id, cfg)| (id.as_str(), cfg))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
