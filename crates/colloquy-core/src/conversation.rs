use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;
use crate::messages::Message;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system_prompt: String,
    /// Conversation-category tag (a key of the configured chat types).
    #[serde(rename = "type", default = "default_category")]
    pub category: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

fn default_category() -> String {
    "normal".to_string()
}

impl Conversation {
    /// True once the log holds exactly one user turn and its answer.
    pub fn is_first_exchange(&self) -> bool {
        self.messages.len() == 2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgeBucket {
    Today,
    LastWeek,
    Earlier,
}

impl AgeBucket {
    pub fn for_age(now_ms: i64, created_at: i64) -> Self {
        let age = now_ms - created_at;
        if age < DAY_MS {
            Self::Today
        } else if age < 7 * DAY_MS {
            Self::LastWeek
        } else {
            Self::Earlier
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::LastWeek => "Previous 7 days",
            Self::Earlier => "Earlier",
        }
    }
}

/// Sidebar grouping of conversations by age.
#[derive(Clone, Debug)]
pub struct ConversationGroup {
    pub bucket: AgeBucket,
    pub items: Vec<Conversation>,
}
