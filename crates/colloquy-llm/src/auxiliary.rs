//! Single-shot model calls that support a generation without being part of
//! it: deciding whether to search, phrasing the query, titling a
//! conversation. Every failure degrades to the neutral answer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use colloquy_core::context::{ChatRequest, RequestMessage};
use colloquy_core::messages::Role;
use colloquy_core::provider::{ChatProvider, ModelEndpoint, SearchJudge, TitleGenerator};

const JUDGE_PROMPT: &str = "You are a search judge. Decide whether answering the user's \
message requires searching the web for current information. Reply with exactly \"true\" \
if it does and \"false\" otherwise, with nothing else.";

const QUERY_PROMPT: &str = "You are a search query writer. Turn the user's message into \
one concise web search query. Reply with the query only, with nothing else.";

const TITLE_PROMPT: &str = "You generate conversation titles. From the user's question \
and the assistant's reply, write a short title of at most 15 words. Reply with the title \
text only, with nothing else.";

async fn ask(
    provider: &dyn ChatProvider,
    endpoint: &ModelEndpoint,
    system: &str,
    user: String,
) -> Option<String> {
    let request = ChatRequest::single_shot(
        endpoint.id.clone(),
        vec![
            RequestMessage::new(Role::System, system),
            RequestMessage::new(Role::User, user),
        ],
    );
    match provider.complete(endpoint, &request).await {
        Ok(answer) => Some(answer.trim().to_string()),
        Err(e) => {
            warn!(model = %endpoint.id, error = %e, kind = e.error_kind(), "auxiliary call failed");
            None
        }
    }
}

/// [`SearchJudge`] backed by the configured judge model. Without a model
/// it never asks for a search.
pub struct ModelJudge {
    provider: Arc<dyn ChatProvider>,
    endpoint: Option<ModelEndpoint>,
}

impl ModelJudge {
    pub fn new(provider: Arc<dyn ChatProvider>, endpoint: Option<ModelEndpoint>) -> Self {
        Self { provider, endpoint }
    }
}

#[async_trait]
impl SearchJudge for ModelJudge {
    async fn needs_search(&self, message: &str) -> bool {
        let Some(endpoint) = &self.endpoint else {
            return false;
        };
        let answer = ask(self.provider.as_ref(), endpoint, JUDGE_PROMPT, message.to_string()).await;
        let decision = answer.is_some_and(|a| a.eq_ignore_ascii_case("true"));
        debug!(decision, "search judged");
        decision
    }

    async fn search_query(&self, message: &str) -> String {
        let Some(endpoint) = &self.endpoint else {
            return message.to_string();
        };
        ask(self.provider.as_ref(), endpoint, QUERY_PROMPT, message.to_string())
            .await
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| message.to_string())
    }
}

/// [`TitleGenerator`] backed by the configured title model.
pub struct ModelTitleGenerator {
    provider: Arc<dyn ChatProvider>,
    endpoint: Option<ModelEndpoint>,
}

impl ModelTitleGenerator {
    pub fn new(provider: Arc<dyn ChatProvider>, endpoint: Option<ModelEndpoint>) -> Self {
        Self { provider, endpoint }
    }
}

#[async_trait]
impl TitleGenerator for ModelTitleGenerator {
    async fn generate_title(&self, user_message: &str, assistant_reply: &str) -> Option<String> {
        let endpoint = self.endpoint.as_ref()?;
        let prompt = format!("User question: {user_message}\nAssistant reply: {assistant_reply}");
        ask(self.provider.as_ref(), endpoint, TITLE_PROMPT, prompt)
            .await
            .filter(|t| !t.is_empty())
    }
}
