//! Settings types with compiled defaults.
//!
//! Every struct uses `#[serde(default, rename_all = "camelCase")]`, so a
//! partial `settings.json` deserializes with the missing fields filled from
//! [`ChatSettings::default()`].

mod models;
mod search;

pub use models::{ChatType, ModelConfig, ModelKind};
pub use search::SearchSettings;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const DEFAULT_URL: &str = "http://localhost:8000/v1/chat/completions";
const DEFAULT_MODEL: &str = "qwen2-57b-a14b-instruct";
const DEFAULT_PROMPT: &str = "You are a professional, friendly and empathetic AI assistant. \
Adapt to the complexity of each question: for complex questions, lay out your reasoning \
clearly and explain in detail; for simple questions, answer directly, accurately and concisely.";

/// Colour scheme. Absent means "follow the system".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
}

/// Root settings for the chat client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatSettings {
    /// Endpoint used by models that do not carry their own URL.
    pub default_url: String,
    /// Key used by models whose key is empty or `"none"`.
    pub default_key: String,
    /// Model selected for new sends.
    pub default_model: String,
    pub title_generation_model: String,
    pub search_judger_model: String,
    pub default_system_prompt: String,
    pub models: BTreeMap<String, ModelConfig>,
    /// Sliding-window size for outgoing context.
    pub context_count: usize,
    pub chat_types: BTreeMap<String, ChatType>,
    pub search: SearchSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    /// Directory holding the conversation database. Empty means
    /// `~/.colloquy`.
    pub data_dir: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "deepseek-r1-distill-qwen-32b".to_string(),
            ModelConfig::new("r1-fast", ModelKind::Thinking, DEFAULT_URL),
        );
        models.insert(
            DEFAULT_MODEL.to_string(),
            ModelConfig::new("qwen2-57b", ModelKind::Normal, DEFAULT_URL),
        );

        let mut chat_types = BTreeMap::new();
        chat_types.insert(
            "normal".to_string(),
            ChatType::new("Chat", DEFAULT_PROMPT),
        );
        chat_types.insert(
            "translator".to_string(),
            ChatType::new(
                "Translator",
                "You are a translation assistant. Translate Chinese input into English and \
                 any other language into Chinese. Everything I send is text to translate; \
                 reply with the translation only.",
            ),
        );
        chat_types.insert(
            "it".to_string(),
            ChatType::new(
                "IT Expert",
                "Act as an IT expert. I will describe my technical problem and you will solve \
                 it in plain language suited to any level, explaining the solution step by \
                 step as bullet points. Reply with the solution rather than background.",
            ),
        );
        chat_types.insert(
            "midjourney".to_string(),
            ChatType::new(
                "Image Prompt Writer",
                "Turn my description into a concrete English prompt for an image generation \
                 model. Describe visible things, not abstract ideas, reorganise scattered \
                 input into a coherent scene, and output only the prompt.",
            ),
        );

        Self {
            default_url: DEFAULT_URL.to_string(),
            default_key: "none".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            title_generation_model: DEFAULT_MODEL.to_string(),
            search_judger_model: DEFAULT_MODEL.to_string(),
            default_system_prompt: DEFAULT_PROMPT.to_string(),
            models,
            context_count: 20,
            chat_types,
            search: SearchSettings::default(),
            theme: None,
            data_dir: String::new(),
        }
    }
}

impl ChatSettings {
    /// Display label and system prompt for a conversation category. Unknown
    /// categories fall back to the key itself and the default prompt.
    pub fn chat_type(&self, category: &str) -> (String, String) {
        match self.chat_types.get(category) {
            Some(t) => (t.name.clone(), t.system_prompt.clone()),
            None => (category.to_string(), self.default_system_prompt.clone()),
        }
    }

    pub fn is_thinking_model(&self, id: &str) -> bool {
        self.models
            .get(id)
            .is_some_and(|m| m.kind == ModelKind::Thinking)
    }
}
