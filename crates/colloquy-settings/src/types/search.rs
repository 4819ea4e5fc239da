use serde::{Deserialize, Serialize};

/// Web-search augmentation settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchSettings {
    pub url: String,
    pub enabled: bool,
    pub token: String,
}

impl SearchSettings {
    /// Search runs only when switched on and a token is present.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.token.is_empty()
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            url: "https://api.bochaai.com/v1/web-search".to_string(),
            enabled: false,
            token: String::new(),
        }
    }
}
