use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, instrument};

use colloquy_core::context::ChatRequest;
use colloquy_core::errors::GatewayError;
use colloquy_core::provider::{ChatProvider, ChunkStream, ModelEndpoint};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound for non-streaming auxiliary calls.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat-completions client for any OpenAI-compatible endpoint. The endpoint
/// URL and key come with every call, so one instance serves all models.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new() -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Ok(Self { client })
    }

    fn build_request(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> reqwest::RequestBuilder {
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        self.client
            .post(&endpoint.url)
            .bearer_auth(endpoint.key.expose_secret())
            .header("accept", accept)
            .json(request)
    }

    async fn send_checked(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = self
            .build_request(endpoint, request)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    #[instrument(skip(self, endpoint, request), fields(model = %endpoint.id, messages = request.messages.len()))]
    async fn open_stream(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let resp = self.send_checked(endpoint, request).await?;
        debug!(status = resp.status().as_u16(), "stream opened");

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GatewayError::StreamInterrupted(e.to_string())));
        Ok(Box::pin(body))
    }

    #[instrument(skip(self, endpoint, request), fields(model = %endpoint.id))]
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<String, GatewayError> {
        let call = async {
            let resp = self.send_checked(endpoint, request).await?;
            let text = resp
                .text()
                .await
                .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
            completion_text(&text)
        };
        tokio::time::timeout(COMPLETION_TIMEOUT, call)
            .await
            .map_err(|_| GatewayError::Timeout(COMPLETION_TIMEOUT))?
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Extract `choices[0].message.content` from a non-streaming response body.
pub fn completion_text(body: &str) -> Result<String, GatewayError> {
    let parsed: CompletionResponse =
        serde_json::from_str(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| GatewayError::InvalidResponse("missing choices[0].message.content".into()))
}
