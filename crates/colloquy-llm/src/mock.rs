use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use colloquy_core::context::ChatRequest;
use colloquy_core::errors::GatewayError;
use colloquy_core::provider::{ChatProvider, ChunkStream, ModelEndpoint};

/// `data:` frame carrying a content delta.
pub fn content_frame(text: &str) -> String {
    let frame = serde_json::json!({"choices": [{"delta": {"content": text}}]});
    format!("data: {frame}\n\n")
}

/// `data:` frame carrying a reasoning delta.
pub fn reasoning_frame(text: &str) -> String {
    let frame = serde_json::json!({"choices": [{"delta": {"reasoning_content": text}}]});
    format!("data: {frame}\n\n")
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Pre-programmed responses for deterministic testing without network.
pub enum MockResponse {
    /// Stream these body chunks, then end.
    Chunks(Vec<Bytes>),
    /// Stream whatever the paired sender pushes, ending when it is dropped.
    Channel(mpsc::Receiver<Result<Bytes, GatewayError>>),
    /// Non-streaming answer for `complete`.
    Text(String),
    /// Fail the call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    /// One content frame per delta, then the sentinel.
    pub fn stream_content(deltas: &[&str]) -> Self {
        Self::stream_reasoned(&[], deltas)
    }

    /// Reasoning frames, then content frames, then the sentinel.
    pub fn stream_reasoned(thinking: &[&str], content: &[&str]) -> Self {
        let mut chunks: Vec<Bytes> = thinking
            .iter()
            .map(|t| Bytes::from(reasoning_frame(t)))
            .collect();
        chunks.extend(content.iter().map(|c| Bytes::from(content_frame(c))));
        chunks.push(Bytes::from_static(DONE_FRAME.as_bytes()));
        Self::Chunks(chunks)
    }

    /// A body delivered verbatim as a single chunk.
    pub fn raw(body: &str) -> Self {
        Self::Chunks(vec![Bytes::from(body.to_string())])
    }

    /// A stream driven by the returned sender.
    pub fn channel() -> (mpsc::Sender<Result<Bytes, GatewayError>>, Self) {
        let (tx, rx) = mpsc::channel(64);
        (tx, Self::Channel(rx))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that hands out pre-programmed responses in sequence and
/// records every request it receives. `open_stream` and `complete` share
/// one queue.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().last().cloned()
    }

    /// Record the call and take the next response, unrolling delays.
    async fn next_response(&self, request: &ChatRequest) -> Result<MockResponse, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let next = self.responses.lock().pop_front();
        let Some(mut current) = next else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };
        loop {
            match current {
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                MockResponse::Error(e) => return Err(e),
                other => return Ok(other),
            }
        }
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn open_stream(
        &self,
        _endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<ChunkStream, GatewayError> {
        match self.next_response(request).await? {
            MockResponse::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            MockResponse::Channel(rx) => Ok(Box::pin(ReceiverStream::new(rx))),
            MockResponse::Text(text) => {
                let body = format!("{}{DONE_FRAME}", content_frame(&text));
                Ok(Box::pin(stream::iter([Ok(Bytes::from(body))])))
            }
            MockResponse::Error(e) => Err(e),
            MockResponse::Delay(..) => Err(GatewayError::InvalidRequest(
                "MockProvider: unresolved delay".into(),
            )),
        }
    }

    async fn complete(
        &self,
        _endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Result<String, GatewayError> {
        match self.next_response(request).await? {
            MockResponse::Text(text) => Ok(text),
            _ => Err(GatewayError::InvalidRequest(
                "MockProvider: streaming response queued for a completion call".into(),
            )),
        }
    }
}
