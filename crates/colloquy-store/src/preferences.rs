use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use colloquy_settings::{ChatSettings, ModelConfig, Theme};

use crate::error::StoreError;
use crate::kv::KvStore;

pub const PREFERRED_MODEL_KEY: &str = "preferred-model";
pub const MODELS_KEY: &str = "models";
pub const TITLE_MODEL_KEY: &str = "titleGenerationModel";
pub const JUDGE_MODEL_KEY: &str = "searchJudgerModel";
pub const SEARCH_TOKEN_KEY: &str = "bochaApiKey";
pub const SEARCH_ENABLED_KEY: &str = "bochaSearchEnabled";
pub const SEARCH_URL_KEY: &str = "bochaSearchUrl";
pub const THEME_KEY: &str = "theme";

/// User choices persisted next to the conversations. They are layered on
/// top of file and environment settings at startup.
#[derive(Clone)]
pub struct PreferencesRepo {
    kv: Arc<dyn KvStore>,
}

impl PreferencesRepo {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Typed read. Values of the wrong shape are ignored with a warning.
    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(value) = self.kv.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(key, error = %e, "ignoring malformed preference");
                Ok(None)
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.kv.set(key, &serde_json::to_value(value)?)?;
        debug!(key, "preference saved");
        Ok(())
    }

    /// Overlay persisted preferences onto `settings`. Empty strings are
    /// treated as unset. A preferred model missing from the model map is
    /// dropped.
    pub fn apply(&self, settings: &mut ChatSettings) -> Result<(), StoreError> {
        if let Some(models) = self.read::<BTreeMap<String, ModelConfig>>(MODELS_KEY)? {
            if !models.is_empty() {
                settings.models = models;
            }
        }
        if let Some(model) = self.read::<String>(PREFERRED_MODEL_KEY)? {
            if settings.models.contains_key(&model) {
                settings.default_model = model;
            } else {
                debug!(model, "preferred model no longer configured");
            }
        }
        if let Some(model) = non_empty(self.read::<String>(TITLE_MODEL_KEY)?) {
            settings.title_generation_model = model;
        }
        if let Some(model) = non_empty(self.read::<String>(JUDGE_MODEL_KEY)?) {
            settings.search_judger_model = model;
        }
        if let Some(token) = non_empty(self.read::<String>(SEARCH_TOKEN_KEY)?) {
            settings.search.token = token;
        }
        if let Some(url) = non_empty(self.read::<String>(SEARCH_URL_KEY)?) {
            settings.search.url = url;
        }
        if let Some(enabled) = self.read::<bool>(SEARCH_ENABLED_KEY)? {
            settings.search.enabled = enabled;
        }
        if let Some(theme) = self.read::<Theme>(THEME_KEY)? {
            settings.theme = Some(theme);
        }
        Ok(())
    }

    pub fn preferred_model(&self) -> Result<Option<String>, StoreError> {
        self.read(PREFERRED_MODEL_KEY)
    }

    pub fn set_preferred_model(&self, id: &str) -> Result<(), StoreError> {
        self.write(PREFERRED_MODEL_KEY, &id)
    }

    pub fn set_models(&self, models: &BTreeMap<String, ModelConfig>) -> Result<(), StoreError> {
        self.write(MODELS_KEY, models)
    }

    pub fn set_title_model(&self, id: &str) -> Result<(), StoreError> {
        self.write(TITLE_MODEL_KEY, &id)
    }

    pub fn set_judge_model(&self, id: &str) -> Result<(), StoreError> {
        self.write(JUDGE_MODEL_KEY, &id)
    }

    pub fn set_search_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.write(SEARCH_ENABLED_KEY, &enabled)
    }

    pub fn set_search_token(&self, token: &str) -> Result<(), StoreError> {
        self.write(SEARCH_TOKEN_KEY, &token)
    }

    pub fn set_search_url(&self, url: &str) -> Result<(), StoreError> {
        self.write(SEARCH_URL_KEY, &url)
    }

    pub fn set_theme(&self, theme: Theme) -> Result<(), StoreError> {
        self.write(THEME_KEY, &theme)
    }

    /// Forget a preference so the file/env layer shows through again.
    pub fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.kv.remove(key)
    }

    /// Raw view for diagnostics.
    pub fn raw(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.kv.get(key)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
