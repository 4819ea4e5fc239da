use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use colloquy_core::context::ChatRequest;
use colloquy_core::errors::GatewayError;
use colloquy_core::events::GenerationEvent;
use colloquy_core::ids::{ConversationId, SessionId};
use colloquy_core::messages::MessageBody;
use colloquy_core::provider::{ChatProvider, ModelEndpoint};
use colloquy_core::stream::{Phase, StreamEvent};
use colloquy_llm::reader::{read_stream, PauseGate, ReadOutcome, StreamControls, STREAM_IDLE_TIMEOUT};
use colloquy_llm::sse::ChatStreamParser;
use colloquy_store::ConversationStore;

use crate::error::EngineError;

/// Slot shared by the controller and the running session.
pub(crate) type ActiveSlot = Arc<Mutex<Option<Arc<SessionControl>>>>;

/// Holds the process-wide "one generation at a time" flag. Acquired with a
/// compare-and-set; dropping it clears the active slot and then the flag.
pub(crate) struct SessionGuard {
    flag: Arc<AtomicBool>,
    slot: ActiveSlot,
}

impl SessionGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>, slot: &ActiveSlot) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            flag: Arc::clone(flag),
            slot: Arc::clone(slot),
        })
    }

    pub(crate) fn install(&self, control: Arc<SessionControl>) {
        *self.slot.lock() = Some(control);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = self.slot.lock().take();
        self.flag.store(false, Ordering::Release);
    }
}

/// Cancellation and pause inputs of one session, shared between its
/// handle, the controller and the read loop.
pub struct SessionControl {
    session_id: SessionId,
    conversation_id: ConversationId,
    cancel: CancellationToken,
    pause: PauseGate,
    events: broadcast::Sender<GenerationEvent>,
}

impl SessionControl {
    pub(crate) fn new(
        conversation_id: ConversationId,
        events: broadcast::Sender<GenerationEvent>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            conversation_id,
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
            events,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(session_id = %self.session_id, "stop requested");
        }
        self.cancel.cancel();
        self.pause.resume();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Returns the new state, `true` meaning paused.
    pub fn toggle_pause(&self) -> bool {
        let paused = self.pause.toggle();
        let session_id = self.session_id.clone();
        self.emit(if paused {
            GenerationEvent::Paused { session_id }
        } else {
            GenerationEvent::Resumed { session_id }
        });
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub(crate) fn emit(&self, event: GenerationEvent) {
        let _ = self.events.send(event);
    }

    fn controls(&self, idle_timeout: Duration) -> StreamControls {
        StreamControls::new(self.cancel.clone(), self.pause.subscribe())
            .with_idle_timeout(idle_timeout)
    }
}

/// Caller-owned view of a running generation.
pub struct SessionHandle {
    control: Arc<SessionControl>,
    task: JoinHandle<Phase>,
}

impl SessionHandle {
    pub(crate) fn new(control: Arc<SessionControl>, task: JoinHandle<Phase>) -> Self {
        Self { control, task }
    }

    pub fn session_id(&self) -> &SessionId {
        self.control.session_id()
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.control.conversation_id()
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn toggle_pause(&self) -> bool {
        self.control.toggle_pause()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session, including any title update, and return its
    /// terminal phase.
    pub async fn wait(self) -> Result<Phase, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("generation task failed: {e}")))
    }
}

/// One generation attempt. Every write goes to the target conversation's
/// last message, whatever conversation is selected meanwhile.
pub struct GenerationSession {
    control: Arc<SessionControl>,
    store: Arc<ConversationStore>,
    parser: ChatStreamParser,
    idle_timeout: Duration,
}

impl GenerationSession {
    pub(crate) fn new(control: Arc<SessionControl>, store: Arc<ConversationStore>) -> Self {
        Self {
            control,
            store,
            parser: ChatStreamParser::new(),
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }

    pub(crate) fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }

    pub fn target(&self) -> &ConversationId {
        self.control.conversation_id()
    }

    pub fn phase(&self) -> Phase {
        self.parser.phase()
    }

    pub fn thinking(&self) -> &str {
        self.parser.thinking()
    }

    pub fn content(&self) -> &str {
        self.parser.content()
    }

    /// Mark the session aborted before any request was sent.
    pub(crate) fn abort(&mut self) -> Phase {
        self.parser.abort();
        self.parser.phase()
    }

    /// Open the stream and paint every delta into the placeholder until the
    /// stream ends, is cancelled or fails. Failures replace the placeholder
    /// with a visible error line.
    pub async fn stream(
        &mut self,
        provider: &dyn ChatProvider,
        endpoint: &ModelEndpoint,
        request: &ChatRequest,
    ) -> Phase {
        let opened = tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => None,
            opened = provider.open_stream(endpoint, request) => Some(opened),
        };
        let body = match opened {
            None => return self.abort(),
            Some(Err(e)) if e.is_cancelled() => return self.abort(),
            Some(Err(e)) => return self.fail(&e),
            Some(Ok(body)) => body,
        };

        let mut controls = self.control.controls(self.idle_timeout);
        let control = Arc::clone(&self.control);
        let store = Arc::clone(&self.store);
        let result = read_stream(body, &mut self.parser, &mut controls, |event, parser| {
            let session_id = control.session_id.clone();
            match event {
                StreamEvent::FirstToken => control.emit(GenerationEvent::FirstToken { session_id }),
                StreamEvent::ReasoningDelta { delta } => {
                    paint(&store, &control.conversation_id, parser.body());
                    control.emit(GenerationEvent::ReasoningDelta {
                        session_id,
                        delta: delta.clone(),
                    });
                }
                StreamEvent::ContentDelta { delta } => {
                    paint(&store, &control.conversation_id, parser.body());
                    control.emit(GenerationEvent::ContentDelta {
                        session_id,
                        delta: delta.clone(),
                    });
                }
                StreamEvent::Done => {}
            }
        })
        .await;

        match result {
            Ok(ReadOutcome::Completed) => {
                info!(
                    session_id = %self.control.session_id,
                    thinking_len = self.parser.thinking().len(),
                    content_len = self.parser.content().len(),
                    "generation completed"
                );
            }
            Ok(ReadOutcome::Aborted) => {
                info!(session_id = %self.control.session_id, "generation aborted");
            }
            Err(e) => return self.fail(&e),
        }
        self.parser.phase()
    }

    fn fail(&mut self, error: &GatewayError) -> Phase {
        self.parser.fail();
        warn!(
            session_id = %self.control.session_id,
            conversation_id = %self.control.conversation_id,
            kind = error.error_kind(),
            error = %error,
            "generation failed"
        );
        paint(
            &self.store,
            &self.control.conversation_id,
            MessageBody::Plain(format!("Error: {error}")),
        );
        self.parser.phase()
    }
}

fn paint(store: &ConversationStore, target: &ConversationId, body: MessageBody) {
    if let Err(e) = store.update_last_message_of(target, body) {
        warn!(conversation_id = %target, error = %e, "dropping stream write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::context::RequestMessage;
    use colloquy_core::messages::{Message, Role};
    use colloquy_llm::mock::{MockProvider, MockResponse};
    use colloquy_store::MemoryKv;

    fn endpoint() -> ModelEndpoint {
        ModelEndpoint::new("m", "M", "http://localhost", "none")
    }

    fn request() -> ChatRequest {
        ChatRequest::streaming("m", vec![RequestMessage::new(Role::User, "hi")])
    }

    fn setup() -> (Arc<ConversationStore>, ConversationId, broadcast::Sender<GenerationEvent>) {
        let store = Arc::new(ConversationStore::open(Arc::new(MemoryKv::new())).unwrap());
        let id = store.create("normal", "", "Chat").unwrap();
        store.add_message(Message::user("hi")).unwrap();
        store.add_message(Message::placeholder()).unwrap();
        let (tx, _) = broadcast::channel(64);
        (store, id, tx)
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let slot: ActiveSlot = Arc::new(Mutex::new(None));
        let (tx, _) = broadcast::channel(4);

        let guard = SessionGuard::acquire(&flag, &slot).unwrap();
        guard.install(Arc::new(SessionControl::new(ConversationId::new(), tx)));
        assert!(SessionGuard::acquire(&flag, &slot).is_none());
        assert!(slot.lock().is_some());

        drop(guard);
        assert!(slot.lock().is_none());
        assert!(SessionGuard::acquire(&flag, &slot).is_some());
    }

    #[test]
    fn stop_is_idempotent_and_releases_pause() {
        let (tx, mut rx) = broadcast::channel(4);
        let control = SessionControl::new(ConversationId::new(), tx);
        assert!(control.toggle_pause());
        assert!(matches!(rx.try_recv().unwrap(), GenerationEvent::Paused { .. }));
        control.stop();
        control.stop();
        assert!(control.is_stopped());
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn paints_reasoned_body() {
        let (store, id, tx) = setup();
        let provider = MockProvider::new(vec![MockResponse::stream_reasoned(&["a"], &["b"])]);
        let control = Arc::new(SessionControl::new(id.clone(), tx));
        let mut session = GenerationSession::new(control, Arc::clone(&store));

        let phase = session.stream(&provider, &endpoint(), &request()).await;
        assert_eq!(phase, Phase::Done);
        assert_eq!(session.thinking(), "a");
        assert_eq!(session.content(), "b");
        let last = store.get(&id).unwrap().messages.pop().unwrap();
        assert_eq!(last.body, MessageBody::from_parts("a", "b"));
    }

    #[tokio::test]
    async fn open_failure_writes_error_line() {
        let (store, id, tx) = setup();
        let provider = MockProvider::new(vec![MockResponse::Error(GatewayError::from_status(
            500,
            "boom".into(),
        ))]);
        let control = Arc::new(SessionControl::new(id.clone(), tx));
        let mut session = GenerationSession::new(control, Arc::clone(&store));

        assert_eq!(session.stream(&provider, &endpoint(), &request()).await, Phase::Errored);
        let last = store.get(&id).unwrap().messages.pop().unwrap();
        assert!(last.text().starts_with("Error: "));
        assert!(last.text().contains("boom"));
    }

    #[tokio::test]
    async fn cancelled_before_open_is_aborted() {
        let (store, id, tx) = setup();
        let (_sender, response) = MockResponse::channel();
        let provider = MockProvider::new(vec![response]);
        let control = Arc::new(SessionControl::new(id.clone(), tx));
        control.stop();
        let mut session = GenerationSession::new(control, Arc::clone(&store));

        assert_eq!(session.stream(&provider, &endpoint(), &request()).await, Phase::Aborted);
        assert!(store.get(&id).unwrap().messages[1].body.is_empty());
    }

    #[tokio::test]
    async fn writes_follow_target_not_selection() {
        let (store, id, tx) = setup();
        let other = store.create("normal", "", "Chat").unwrap();
        let provider = MockProvider::new(vec![MockResponse::stream_content(&["x", "y"])]);
        let control = Arc::new(SessionControl::new(id.clone(), tx));
        let mut session = GenerationSession::new(control, Arc::clone(&store));

        assert_eq!(session.stream(&provider, &endpoint(), &request()).await, Phase::Done);
        assert_eq!(store.current_id(), Some(other.clone()));
        assert_eq!(store.get(&id).unwrap().messages[1].text(), "xy");
        assert!(store.get(&other).unwrap().messages.is_empty());
    }
}
