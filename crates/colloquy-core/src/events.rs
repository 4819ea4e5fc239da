use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, SessionId};
use crate::stream::Phase;

/// Generation lifecycle events broadcast to renderers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GenerationEvent {
    #[serde(rename = "started")]
    Started {
        session_id: SessionId,
        conversation_id: ConversationId,
    },

    /// Clears any loading indicator.
    #[serde(rename = "first_token")]
    FirstToken { session_id: SessionId },

    #[serde(rename = "reasoning_delta")]
    ReasoningDelta { session_id: SessionId, delta: String },

    #[serde(rename = "content_delta")]
    ContentDelta { session_id: SessionId, delta: String },

    #[serde(rename = "paused")]
    Paused { session_id: SessionId },

    #[serde(rename = "resumed")]
    Resumed { session_id: SessionId },

    #[serde(rename = "finished")]
    Finished {
        session_id: SessionId,
        conversation_id: ConversationId,
        phase: Phase,
    },

    #[serde(rename = "title_updated")]
    TitleUpdated {
        conversation_id: ConversationId,
        title: String,
    },
}

impl GenerationEvent {
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Started { session_id, .. }
            | Self::FirstToken { session_id }
            | Self::ReasoningDelta { session_id, .. }
            | Self::ContentDelta { session_id, .. }
            | Self::Paused { session_id }
            | Self::Resumed { session_id }
            | Self::Finished { session_id, .. } => Some(session_id),
            Self::TitleUpdated { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::FirstToken { .. } => "first_token",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ContentDelta { .. } => "content_delta",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Finished { .. } => "finished",
            Self::TitleUpdated { .. } => "title_updated",
        }
    }
}
