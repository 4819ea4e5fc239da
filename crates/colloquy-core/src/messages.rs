use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Which of the two content encodings a message carries. Persisted as the
/// message's `type` tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Thinking,
    Normal,
}

/// Message content: either a plain answer, or an answer that was preceded by
/// a reasoning phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Plain(String),
    Reasoned { thinking: String, text: String },
}

impl MessageBody {
    /// Apply the encoding rule: any non-empty reasoning output selects the
    /// reasoned variant, otherwise the plain text is kept as-is.
    pub fn from_parts(thinking: &str, text: &str) -> Self {
        if thinking.is_empty() {
            Self::Plain(text.to_string())
        } else {
            Self::Reasoned {
                thinking: thinking.to_string(),
                text: text.to_string(),
            }
        }
    }

    pub fn empty() -> Self {
        Self::Plain(String::new())
    }

    /// Final-answer text, without reasoning.
    pub fn text(&self) -> &str {
        match self {
            Self::Plain(text) | Self::Reasoned { text, .. } => text,
        }
    }

    pub fn thinking(&self) -> Option<&str> {
        match self {
            Self::Plain(_) => None,
            Self::Reasoned { thinking, .. } => Some(thinking),
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Plain(_) => ContentKind::Normal,
            Self::Reasoned { .. } => ContentKind::Thinking,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Plain(text) => text.is_empty(),
            Self::Reasoned { thinking, text } => thinking.is_empty() && text.is_empty(),
        }
    }
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttachmentMetadata {
    Files { files: Vec<FileInfo> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
}

/// A file whose text has already been extracted and is ready to be embedded
/// in a user message.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub content: String,
}

impl Attachment {
    pub fn as_block(&self) -> String {
        format!("[File: {}]\n{}", self.file_name, self.content)
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            file_name: self.file_name.clone(),
            file_type: self.mime_type.clone(),
            file_size: self.size,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredMessage", into = "StoredMessage")]
pub struct Message {
    pub role: Role,
    pub body: MessageBody,
    pub search_results: Option<String>,
    pub attachments: Option<AttachmentMetadata>,
}

impl Message {
    pub fn new(role: Role, body: MessageBody) -> Self {
        Self {
            role,
            body,
            search_results: None,
            attachments: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageBody::Plain(text.into()))
    }

    pub fn assistant(body: MessageBody) -> Self {
        Self::new(Role::Assistant, body)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageBody::Plain(text.into()))
    }

    /// Empty assistant message that a generation session paints into.
    pub fn placeholder() -> Self {
        Self::assistant(MessageBody::empty())
    }

    /// Build the user turn for a send: attachment blocks first, then the
    /// typed text.
    pub fn compose_user(text: &str, attachments: &[Attachment]) -> Self {
        if attachments.is_empty() {
            return Self::user(text);
        }
        let blocks = attachments
            .iter()
            .map(Attachment::as_block)
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut msg = Self::user(format!("{blocks}\n\n{text}"));
        msg.attachments = Some(AttachmentMetadata::Files {
            files: attachments.iter().map(Attachment::info).collect(),
        });
        msg
    }

    pub fn text(&self) -> &str {
        self.body.text()
    }
}

/// On-disk shape. `type` tags the encoding; reasoned messages carry an extra
/// `thinking` field next to `content`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<ContentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search_results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<AttachmentMetadata>,
}

/// Older exports stored reasoned messages as a JSON string inside `content`.
#[derive(Deserialize)]
struct LegacyReasoned {
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    content: String,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        let body = match (stored.kind, stored.thinking) {
            (Some(ContentKind::Thinking), Some(thinking)) => {
                MessageBody::from_parts(&thinking, &stored.content)
            }
            (Some(ContentKind::Thinking), None) => {
                match serde_json::from_str::<LegacyReasoned>(&stored.content) {
                    Ok(legacy) => MessageBody::from_parts(
                        legacy.thinking.as_deref().unwrap_or_default(),
                        &legacy.content,
                    ),
                    Err(_) => MessageBody::Plain(stored.content),
                }
            }
            _ => MessageBody::Plain(stored.content),
        };
        Message {
            role: stored.role,
            body,
            search_results: stored.search_results,
            attachments: stored.metadata,
        }
    }
}

impl From<Message> for StoredMessage {
    fn from(msg: Message) -> Self {
        let kind = Some(msg.body.kind());
        let (content, thinking) = match msg.body {
            MessageBody::Plain(text) => (text, None),
            MessageBody::Reasoned { thinking, text } => (text, Some(thinking)),
        };
        StoredMessage {
            role: msg.role,
            content,
            kind,
            thinking,
            search_results: msg.search_results,
            metadata: msg.attachments,
        }
    }
}
