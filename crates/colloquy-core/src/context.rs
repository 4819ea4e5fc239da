use serde::Serialize;

use crate::messages::Role;

/// One entry of the outgoing `messages` array. Only role and content are
/// ever transmitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

impl RequestMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Chat-completion request body.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn streaming(model: impl Into<String>, messages: Vec<RequestMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }

    pub fn single_shot(model: impl Into<String>, messages: Vec<RequestMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
        }
    }
}
