use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use colloquy_core::conversation::Conversation;
use colloquy_core::ids::ConversationId;
use colloquy_core::messages::Message;

use crate::conversations::ConversationStore;
use crate::error::StoreError;

pub const EXPORT_VERSION: &str = "1.0";
const IMPORT_LABEL: &str = "Imported";

/// Portable snapshot of one conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(rename = "type", default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub export_date: String,
    #[serde(default)]
    pub version: String,
}

fn default_category() -> String {
    "normal".to_string()
}

impl ExportDocument {
    pub fn from_conversation(conv: &Conversation, at: DateTime<Utc>) -> Self {
        Self {
            title: conv.title.clone(),
            messages: conv.messages.clone(),
            system_prompt: conv.system_prompt.clone(),
            category: conv.category.clone(),
            export_date: at.to_rfc3339(),
            version: EXPORT_VERSION.to_string(),
        }
    }

    /// `{title}_{YYYY-MM-DD}.json`, dated by the export timestamp.
    pub fn file_name(&self) -> String {
        let date = DateTime::parse_from_rfc3339(&self.export_date)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
            .format("%Y-%m-%d");
        format!("{}_{date}.json", self.title)
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate an exported document. A non-empty `title` and a
    /// `messages` array are required; everything else has a default.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| StoreError::InvalidImport(format!("not JSON: {e}")))?;
        let title_ok = value
            .get("title")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        if !title_ok {
            return Err(StoreError::InvalidImport("missing title".into()));
        }
        if !value.get("messages").is_some_and(Value::is_array) {
            return Err(StoreError::InvalidImport("messages is not an array".into()));
        }
        serde_json::from_value(value).map_err(|e| StoreError::InvalidImport(e.to_string()))
    }
}

impl ConversationStore {
    /// Snapshot a conversation for export.
    pub fn export(&self, id: &ConversationId) -> Result<ExportDocument, StoreError> {
        let conv = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(ExportDocument::from_conversation(&conv, Utc::now()))
    }

    /// Materialise a document as a new, selected conversation. The exported
    /// id is never reused.
    pub fn import(&self, doc: ExportDocument) -> Result<ConversationId, StoreError> {
        let id = self.create(&doc.category, &doc.system_prompt, IMPORT_LABEL)?;
        let _ = self.update_title(&id, &doc.title)?;
        let count = doc.messages.len();
        let _ = self.set_messages(&id, doc.messages)?;
        info!(conversation_id = %id, messages = count, "conversation imported");
        Ok(id)
    }
}
