use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::context::ChatRequest;
use crate::errors::GatewayError;

/// Raw response body of a streaming completion, chunked as it arrives.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// A resolved model: the identifier sent in requests plus where and how to
/// reach it.
#[derive(Clone)]
pub struct ModelEndpoint {
    pub id: String,
    pub name: String,
    pub url: String,
    pub key: SecretString,
}

impl ModelEndpoint {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            key: SecretString::from(key.into()),
        }
    }
}

impl std::fmt::Debug for ModelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEndpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// An OpenAI-compatible chat-completions backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Issue a streaming request. Non-success statuses surface here as
    /// errors; the returned stream yields the body chunk by chunk.
    async fn open_stream(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChunkStream, GatewayError>;

    /// Issue a non-streaming request and return `choices[0].message.content`.
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<String, GatewayError>;
}

/// One web search hit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[async_trait]
pub trait SearchService: Send + Sync {
    /// Run a web search. Failures and disabled search both yield no hits.
    async fn search(&self, query: &str) -> Vec<SearchHit>;
}

#[async_trait]
pub trait SearchJudge: Send + Sync {
    /// Decide whether `message` needs fresh web information. Any failure
    /// counts as "no".
    async fn needs_search(&self, message: &str) -> bool;

    /// Condense `message` into a search query, falling back to the message
    /// itself.
    async fn search_query(&self, message: &str) -> String;
}

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    /// Produce a short title for the first exchange of a conversation.
    async fn generate_title(&self, user_message: &str, assistant_reply: &str)
        -> Option<String>;
}
