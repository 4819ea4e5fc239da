use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use colloquy_core::context::ChatRequest;
use colloquy_core::events::GenerationEvent;
use colloquy_core::ids::ConversationId;
use colloquy_core::messages::{Attachment, Message, Role};
use colloquy_core::provider::{ChatProvider, ModelEndpoint, SearchJudge, SearchService, TitleGenerator};
use colloquy_core::stream::Phase;
use colloquy_llm::format_search_results;
use colloquy_llm::reader::STREAM_IDLE_TIMEOUT;
use colloquy_settings::{ChatSettings, ModelRegistry};
use colloquy_store::ConversationStore;

use crate::context::ContextBuilder;
use crate::error::EngineError;
use crate::session::{ActiveSlot, GenerationSession, SessionControl, SessionGuard, SessionHandle};

const EVENT_CAPACITY: usize = 1024;

/// Where the search augmentation of a session comes from.
enum SearchStep {
    /// Ask the judge, then search, and attach results to the user turn.
    Fresh {
        judge: Arc<dyn SearchJudge>,
        service: Arc<dyn SearchService>,
        text: String,
    },
    /// Regeneration: reuse whatever the user turn already carries.
    Reuse(Option<String>),
    Skip,
}

/// Orchestrates sends and regenerations against a [`ConversationStore`].
///
/// At most one session runs at a time across all conversations. `send` and
/// `regenerate` must be called from within a Tokio runtime; the session runs
/// on a spawned task and is observed through the returned [`SessionHandle`]
/// or [`GenerationController::subscribe`].
pub struct GenerationController {
    store: Arc<ConversationStore>,
    provider: Arc<dyn ChatProvider>,
    settings: ChatSettings,
    registry: ModelRegistry,
    builder: ContextBuilder,
    model: RwLock<String>,
    judge: Option<Arc<dyn SearchJudge>>,
    search: Option<Arc<dyn SearchService>>,
    titles: Option<Arc<dyn TitleGenerator>>,
    active: Arc<AtomicBool>,
    slot: ActiveSlot,
    events: broadcast::Sender<GenerationEvent>,
    idle_timeout: Duration,
}

impl GenerationController {
    pub fn new(
        store: Arc<ConversationStore>,
        provider: Arc<dyn ChatProvider>,
        settings: ChatSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: ModelRegistry::from_settings(&settings),
            builder: ContextBuilder::new(settings.context_count, settings.default_system_prompt.clone()),
            model: RwLock::new(settings.default_model.clone()),
            store,
            provider,
            settings,
            judge: None,
            search: None,
            titles: None,
            active: Arc::new(AtomicBool::new(false)),
            slot: Arc::new(Mutex::new(None)),
            events,
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }

    pub fn with_search(mut self, judge: Arc<dyn SearchJudge>, service: Arc<dyn SearchService>) -> Self {
        self.judge = Some(judge);
        self.search = Some(service);
        self
    }

    pub fn with_titles(mut self, titles: Arc<dyn TitleGenerator>) -> Self {
        self.titles = Some(titles);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn model(&self) -> String {
        self.model.read().clone()
    }

    /// Switch the model used by later sessions.
    pub fn set_model(&self, id: &str) -> Result<(), EngineError> {
        if !self.registry.contains(id) {
            return Err(EngineError::ModelNotConfigured(id.to_string()));
        }
        *self.model.write() = id.to_string();
        Ok(())
    }

    fn endpoint(&self) -> Result<ModelEndpoint, EngineError> {
        let id = self.model();
        self.registry
            .resolve(&id)
            .ok_or(EngineError::ModelNotConfigured(id))
    }

    /// Create and select a conversation of `category`. Rejected while a
    /// session is running.
    pub fn new_conversation(&self, category: &str) -> Result<ConversationId, EngineError> {
        if self.is_busy() {
            return Err(EngineError::Busy);
        }
        let (label, prompt) = self.settings.chat_type(category);
        Ok(self.store.create(category, &prompt, &label)?)
    }

    /// Append a user turn to the current conversation and start streaming
    /// the answer into a fresh placeholder.
    #[instrument(skip(self, text, attachments), fields(attachments = attachments.len()))]
    pub fn send(&self, text: &str, attachments: &[Attachment]) -> Result<SessionHandle, EngineError> {
        let guard = SessionGuard::acquire(&self.active, &self.slot).ok_or(EngineError::Busy)?;
        let target = self.store.current_id().ok_or(EngineError::NoConversation)?;
        let endpoint = self.endpoint()?;

        self.store
            .add_message_to(&target, Message::compose_user(text, attachments))?;

        let search = match (&self.judge, &self.search) {
            (Some(judge), Some(service)) if self.settings.search.enabled && attachments.is_empty() => {
                SearchStep::Fresh {
                    judge: Arc::clone(judge),
                    service: Arc::clone(service),
                    text: text.to_string(),
                }
            }
            _ => SearchStep::Skip,
        };
        Ok(self.spawn(guard, target, endpoint, search, text.to_string()))
    }

    /// Replace the last assistant message with a new answer. Only the last
    /// message qualifies, and only when it answers a user turn.
    #[instrument(skip(self))]
    pub fn regenerate(&self, index: usize) -> Result<SessionHandle, EngineError> {
        let guard = SessionGuard::acquire(&self.active, &self.slot).ok_or(EngineError::Busy)?;
        let conv = self.store.current().ok_or(EngineError::NoConversation)?;

        let last = match conv.messages.last() {
            Some(last) if conv.messages.len() - 1 == index => last,
            _ => {
                return Err(EngineError::InvalidRegenerate(format!(
                    "message {index} is not the last message"
                )))
            }
        };
        if last.role != Role::Assistant {
            return Err(EngineError::InvalidRegenerate(format!(
                "message {index} is not an assistant message"
            )));
        }
        let user = index
            .checked_sub(1)
            .and_then(|i| conv.messages.get(i))
            .filter(|m| m.role == Role::User)
            .ok_or_else(|| {
                EngineError::InvalidRegenerate(format!("message {index} does not answer a user message"))
            })?;
        let endpoint = self.endpoint()?;

        let search = SearchStep::Reuse(user.search_results.clone());
        let seed = user.text().to_string();
        let _ = self.store.delete_message(index)?;
        Ok(self.spawn(guard, conv.id, endpoint, search, seed))
    }

    /// Cancel the running session, if any. Idempotent.
    pub fn stop(&self) -> bool {
        match self.slot.lock().clone() {
            Some(control) => {
                control.stop();
                true
            }
            None => false,
        }
    }

    /// Flip pause on the running session. `None` when nothing is running.
    pub fn toggle_pause(&self) -> Option<bool> {
        let control = self.slot.lock().clone()?;
        Some(control.toggle_pause())
    }

    fn spawn(
        &self,
        guard: SessionGuard,
        target: ConversationId,
        endpoint: ModelEndpoint,
        search: SearchStep,
        title_seed: String,
    ) -> SessionHandle {
        let control = Arc::new(SessionControl::new(target.clone(), self.events.clone()));
        guard.install(Arc::clone(&control));
        info!(
            session_id = %control.session_id(),
            conversation_id = %target,
            model = %endpoint.id,
            "generation started"
        );
        control.emit(GenerationEvent::Started {
            session_id: control.session_id().clone(),
            conversation_id: target,
        });

        let job = SessionJob {
            session: GenerationSession::new(Arc::clone(&control), Arc::clone(&self.store))
                .with_idle_timeout(self.idle_timeout),
            guard,
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            endpoint,
            builder: self.builder.clone(),
            search,
            titles: self.titles.clone(),
            title_seed,
        };
        SessionHandle::new(control, tokio::spawn(job.run()))
    }
}

/// Everything a spawned session needs, owned.
struct SessionJob {
    session: GenerationSession,
    guard: SessionGuard,
    store: Arc<ConversationStore>,
    provider: Arc<dyn ChatProvider>,
    endpoint: ModelEndpoint,
    builder: ContextBuilder,
    search: SearchStep,
    titles: Option<Arc<dyn TitleGenerator>>,
    title_seed: String,
}

impl SessionJob {
    async fn run(self) -> Phase {
        let SessionJob {
            mut session,
            guard,
            store,
            provider,
            endpoint,
            builder,
            search,
            titles,
            title_seed,
        } = self;
        let control = Arc::clone(session.control());
        let target = control.conversation_id().clone();

        let search_results = match search {
            SearchStep::Fresh { judge, service, text } => {
                let results = tokio::select! {
                    biased;
                    _ = control.cancelled() => None,
                    results = augment(judge.as_ref(), service.as_ref(), &text) => results,
                };
                if let Some(results) = &results {
                    if let Err(e) = store.update_last_message_fields(&target, Some(results.clone())) {
                        warn!(conversation_id = %target, error = %e, "failed to attach search results");
                    }
                }
                results
            }
            SearchStep::Reuse(results) => results,
            SearchStep::Skip => None,
        };

        let phase = match prepare(&store, &builder, &endpoint, &target, search_results.as_deref()) {
            Some(request) if !control.is_stopped() => {
                session.stream(provider.as_ref(), &endpoint, &request).await
            }
            _ => session.abort(),
        };

        drop(guard);
        control.emit(GenerationEvent::Finished {
            session_id: control.session_id().clone(),
            conversation_id: target.clone(),
            phase,
        });

        if phase == Phase::Done {
            if let Some(titles) = titles {
                update_title(&store, titles.as_ref(), &control, &target, &title_seed).await;
            }
        }
        phase
    }
}

/// Build the request from the log as it stands, then append the
/// placeholder so it never reaches the model.
fn prepare(
    store: &ConversationStore,
    builder: &ContextBuilder,
    endpoint: &ModelEndpoint,
    target: &ConversationId,
    search_results: Option<&str>,
) -> Option<ChatRequest> {
    let Some(conv) = store.get(target) else {
        warn!(conversation_id = %target, "conversation vanished before generation");
        return None;
    };
    let messages = builder.build(&conv.system_prompt, &conv.messages, search_results);
    if let Err(e) = store.add_message_to(target, Message::placeholder()) {
        warn!(conversation_id = %target, error = %e, "failed to add placeholder");
        return None;
    }
    Some(ChatRequest::streaming(endpoint.id.clone(), messages))
}

async fn augment(judge: &dyn SearchJudge, service: &dyn SearchService, text: &str) -> Option<String> {
    if !judge.needs_search(text).await {
        return None;
    }
    let query = judge.search_query(text).await;
    let hits = service.search(&query).await;
    debug!(query, hits = hits.len(), "search finished");
    if hits.is_empty() {
        None
    } else {
        Some(format_search_results(&hits))
    }
}

/// Name the conversation after its first exchange.
async fn update_title(
    store: &ConversationStore,
    titles: &dyn TitleGenerator,
    control: &SessionControl,
    target: &ConversationId,
    user_text: &str,
) {
    let Some(conv) = store.get(target) else {
        return;
    };
    if !conv.is_first_exchange() {
        return;
    }
    let reply = conv.messages[1].text();
    let Some(title) = titles.generate_title(user_text, reply).await else {
        return;
    };
    match store.update_title(target, &title) {
        Ok(true) => control.emit(GenerationEvent::TitleUpdated {
            conversation_id: target.clone(),
            title,
        }),
        Ok(false) => {}
        Err(e) => warn!(conversation_id = %target, error = %e, "failed to save title"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use colloquy_core::errors::GatewayError;
    use colloquy_core::messages::{ContentKind, MessageBody};
    use colloquy_core::provider::SearchHit;
    use colloquy_llm::mock::{content_frame, MockProvider, MockResponse, DONE_FRAME};
    use colloquy_store::MemoryKv;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeJudge {
        needs: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchJudge for FakeJudge {
        async fn needs_search(&self, _message: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.needs
        }

        async fn search_query(&self, message: &str) -> String {
            format!("query: {message}")
        }
    }

    #[derive(Default)]
    struct FakeSearch {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchService for FakeSearch {
        async fn search(&self, query: &str) -> Vec<SearchHit> {
            self.queries.lock().push(query.to_string());
            vec![SearchHit {
                name: "Rust Blog".into(),
                url: "https://blog.rust-lang.org".into(),
                summary: Some("release notes".into()),
            }]
        }
    }

    #[derive(Default)]
    struct FakeTitles {
        title: Option<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TitleGenerator for FakeTitles {
        async fn generate_title(&self, user_message: &str, assistant_reply: &str) -> Option<String> {
            self.calls
                .lock()
                .push((user_message.to_string(), assistant_reply.to_string()));
            self.title.clone()
        }
    }

    struct Harness {
        controller: GenerationController,
        store: Arc<ConversationStore>,
        provider: Arc<MockProvider>,
    }

    fn harness_with(settings: ChatSettings, responses: Vec<MockResponse>) -> Harness {
        let store = Arc::new(ConversationStore::open(Arc::new(MemoryKv::new())).unwrap());
        store.create("normal", "be helpful", "Chat").unwrap();
        let provider = Arc::new(MockProvider::new(responses));
        let controller = GenerationController::new(Arc::clone(&store), provider.clone(), settings);
        Harness {
            controller,
            store,
            provider,
        }
    }

    fn harness(responses: Vec<MockResponse>) -> Harness {
        harness_with(ChatSettings::default(), responses)
    }

    fn search_settings() -> ChatSettings {
        let mut settings = ChatSettings::default();
        settings.search.enabled = true;
        settings.search.token = "tok".into();
        settings
    }

    fn last_message(store: &ConversationStore) -> Message {
        store.current().unwrap().messages.pop().unwrap()
    }

    async fn content_deltas(rx: &mut broadcast::Receiver<GenerationEvent>, n: usize) {
        let mut seen = 0;
        while seen < n {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for deltas")
                .unwrap();
            if matches!(event, GenerationEvent::ContentDelta { .. }) {
                seen += 1;
            }
        }
    }

    fn frame(text: &str) -> Result<Bytes, GatewayError> {
        Ok(Bytes::from(content_frame(text)))
    }

    #[tokio::test]
    async fn plain_stream_yields_normal_message() {
        let h = harness(vec![MockResponse::raw(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\ndata: [DONE]\n\n",
        )]);
        let phase = h.controller.send("hi", &[]).unwrap().wait().await.unwrap();
        assert_eq!(phase, Phase::Done);

        let msg = last_message(&h.store);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.body, MessageBody::Plain("hello".into()));
        assert_eq!(msg.body.kind(), ContentKind::Normal);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "normal");
        assert_eq!(json["content"], "hello");
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn reasoning_then_content_yields_thinking_message() {
        let h = harness(vec![MockResponse::raw(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"a\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n\
             data: [DONE]\n\n",
        )]);
        let phase = h.controller.send("hi", &[]).unwrap().wait().await.unwrap();
        assert_eq!(phase, Phase::Done);

        let msg = last_message(&h.store);
        assert_eq!(msg.body.kind(), ContentKind::Thinking);
        assert_eq!(msg.body.thinking(), Some("a"));
        assert_eq!(msg.text(), "b");
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let body = format!(
            "{}data: {{not json\n\n{}{DONE_FRAME}",
            content_frame("a"),
            content_frame("b")
        );
        let h = harness(vec![MockResponse::raw(&body)]);
        let phase = h.controller.send("hi", &[]).unwrap().wait().await.unwrap();
        assert_eq!(phase, Phase::Done);
        assert_eq!(last_message(&h.store).text(), "ab");
    }

    #[tokio::test]
    async fn request_excludes_placeholder_and_uses_model_id() {
        let h = harness(vec![MockResponse::stream_content(&["ok"])]);
        h.controller.send("question", &[]).unwrap().wait().await.unwrap();

        let req = h.provider.last_request().unwrap();
        assert!(req.stream);
        assert_eq!(req.model, ChatSettings::default().default_model);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].content, "be helpful");
        assert_eq!(req.messages[1].content, "question");
    }

    #[tokio::test]
    async fn cancel_after_two_deltas_keeps_them() {
        let (tx, response) = MockResponse::channel();
        let h = harness(vec![response]);
        let mut rx = h.controller.subscribe();
        let handle = h.controller.send("hi", &[]).unwrap();

        tx.send(frame("one ")).await.unwrap();
        tx.send(frame("two")).await.unwrap();
        content_deltas(&mut rx, 2).await;

        assert!(h.controller.stop());
        assert_eq!(handle.wait().await.unwrap(), Phase::Aborted);
        assert_eq!(last_message(&h.store).text(), "one two");
        assert!(!h.controller.is_busy());
        assert!(!h.controller.stop());
        drop(tx);
    }

    #[tokio::test]
    async fn second_session_and_new_conversation_rejected_while_busy() {
        let (tx, response) = MockResponse::channel();
        let h = harness(vec![response]);
        let mut rx = h.controller.subscribe();
        let handle = h.controller.send("first", &[]).unwrap();
        tx.send(frame("partial")).await.unwrap();
        content_deltas(&mut rx, 1).await;

        assert!(matches!(h.controller.send("second", &[]), Err(EngineError::Busy)));
        assert!(matches!(h.controller.new_conversation("normal"), Err(EngineError::Busy)));
        assert!(matches!(h.controller.regenerate(1), Err(EngineError::Busy)));
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.current().unwrap().messages.len(), 2);

        tx.send(frame(" answer")).await.unwrap();
        tx.send(Ok(Bytes::from_static(DONE_FRAME.as_bytes()))).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), Phase::Done);
        assert_eq!(last_message(&h.store).text(), "partial answer");

        let id = h.controller.new_conversation("translator").unwrap();
        assert_eq!(h.store.get(&id).unwrap().title, "Translator 1");
    }

    #[tokio::test]
    async fn pause_holds_stream_until_resumed() {
        let (tx, response) = MockResponse::channel();
        let h = harness(vec![response]);
        let mut rx = h.controller.subscribe();
        let handle = h.controller.send("hi", &[]).unwrap();
        assert_eq!(h.controller.toggle_pause(), Some(true));
        assert!(handle.is_paused());

        tx.send(frame("held")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(last_message(&h.store).body.is_empty());

        assert_eq!(h.controller.toggle_pause(), Some(false));
        content_deltas(&mut rx, 1).await;
        assert_eq!(last_message(&h.store).text(), "held");

        drop(tx);
        assert_eq!(handle.wait().await.unwrap(), Phase::Done);
        assert_eq!(h.controller.toggle_pause(), None);
    }

    #[tokio::test]
    async fn transport_failure_writes_error_text() {
        let h = harness(vec![MockResponse::Error(GatewayError::from_status(
            502,
            "bad gateway".into(),
        ))]);
        let phase = h.controller.send("hi", &[]).unwrap().wait().await.unwrap();
        assert_eq!(phase, Phase::Errored);
        let text = last_message(&h.store).text().to_string();
        assert!(text.starts_with("Error: "), "{text}");
        assert!(text.contains("bad gateway"));
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn unconfigured_model_fails_without_mutation() {
        let mut settings = ChatSettings::default();
        settings.default_model = "missing".into();
        let h = harness_with(settings, vec![]);
        assert!(matches!(
            h.controller.send("hi", &[]),
            Err(EngineError::ModelNotConfigured(id)) if id == "missing"
        ));
        assert!(h.store.current().unwrap().messages.is_empty());
        assert!(!h.controller.is_busy());
        assert!(h.controller.set_model("missing").is_err());
    }

    #[tokio::test]
    async fn send_without_conversation_fails() {
        let h = harness(vec![]);
        let id = h.store.current_id().unwrap();
        h.store.delete(&id).unwrap();
        assert!(matches!(h.controller.send("hi", &[]), Err(EngineError::NoConversation)));
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn regenerate_rejects_non_last_message() {
        let h = harness(vec![MockResponse::stream_content(&["one"])]);
        h.controller.send("q", &[]).unwrap().wait().await.unwrap();
        let before = h.store.current().unwrap();

        assert!(matches!(h.controller.regenerate(0), Err(EngineError::InvalidRegenerate(_))));
        assert!(matches!(h.controller.regenerate(5), Err(EngineError::InvalidRegenerate(_))));
        assert_eq!(h.store.current().unwrap(), before);
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn regenerate_rejects_out_of_range_index() {
        let h = harness(vec![MockResponse::stream_content(&["one"])]);
        assert!(matches!(
            h.controller.regenerate(usize::MAX),
            Err(EngineError::InvalidRegenerate(_))
        ));
        assert!(h.store.current().unwrap().messages.is_empty());

        h.controller.send("q", &[]).unwrap().wait().await.unwrap();
        let before = h.store.current().unwrap();
        assert!(matches!(
            h.controller.regenerate(usize::MAX),
            Err(EngineError::InvalidRegenerate(_))
        ));
        assert_eq!(h.store.current().unwrap(), before);
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn regenerate_replaces_last_answer() {
        let h = harness(vec![
            MockResponse::stream_content(&["first"]),
            MockResponse::stream_content(&["second"]),
        ]);
        h.controller.send("q", &[]).unwrap().wait().await.unwrap();
        let phase = h.controller.regenerate(1).unwrap().wait().await.unwrap();
        assert_eq!(phase, Phase::Done);

        let conv = h.store.current().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].text(), "second");
        assert_eq!(h.provider.last_request().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn search_results_attach_to_user_turn_and_prompt() {
        let judge = Arc::new(FakeJudge { needs: true, ..Default::default() });
        let search = Arc::new(FakeSearch::default());
        let mut h = harness_with(
            search_settings(),
            vec![
                MockResponse::stream_content(&["answer"]),
                MockResponse::stream_content(&["again"]),
            ],
        );
        h.controller = h.controller.with_search(judge.clone(), search.clone());

        h.controller.send("rust news", &[]).unwrap().wait().await.unwrap();
        assert_eq!(*search.queries.lock(), vec!["query: rust news".to_string()]);

        let user = &h.store.current().unwrap().messages[0];
        let results = user.search_results.clone().unwrap();
        assert!(results.starts_with("Source 1: Rust Blog"));
        let system = h.provider.last_request().unwrap().messages[0].content.clone();
        assert!(system.contains("Source 1: Rust Blog"));

        // Regeneration reuses the attached results without asking again.
        h.controller.regenerate(1).unwrap().wait().await.unwrap();
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        let system = h.provider.last_request().unwrap().messages[0].content.clone();
        assert!(system.contains("Source 1: Rust Blog"));
    }

    #[tokio::test]
    async fn search_skipped_when_judge_declines_or_files_attached() {
        let judge = Arc::new(FakeJudge::default());
        let search = Arc::new(FakeSearch::default());
        let mut h = harness_with(
            search_settings(),
            vec![
                MockResponse::stream_content(&["a"]),
                MockResponse::stream_content(&["b"]),
            ],
        );
        h.controller = h.controller.with_search(judge.clone(), search.clone());

        h.controller.send("hello", &[]).unwrap().wait().await.unwrap();
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert!(search.queries.lock().is_empty());

        let file = Attachment {
            file_name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            size: 5,
            content: "notes".into(),
        };
        h.controller.send("summarise", &[file]).unwrap().wait().await.unwrap();
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);

        let conv = h.store.current().unwrap();
        assert_eq!(conv.messages[2].text(), "[File: notes.txt]\nnotes\n\nsummarise");
        assert!(conv.messages[2].search_results.is_none());
    }

    #[tokio::test]
    async fn title_generated_after_first_exchange_only() {
        let titles = Arc::new(FakeTitles {
            title: Some("Greeting".into()),
            ..Default::default()
        });
        let mut h = harness(vec![
            MockResponse::stream_content(&["hello ", "there"]),
            MockResponse::stream_content(&["more"]),
        ]);
        h.controller = h.controller.with_titles(titles.clone());
        let mut rx = h.controller.subscribe();

        h.controller.send("hi", &[]).unwrap().wait().await.unwrap();
        assert_eq!(h.store.current().unwrap().title, "Greeting");
        assert_eq!(
            *titles.calls.lock(),
            vec![("hi".to_string(), "hello there".to_string())]
        );

        let mut saw_title = false;
        while let Ok(event) = rx.try_recv() {
            if let GenerationEvent::TitleUpdated { title, .. } = event {
                saw_title = title == "Greeting";
            }
        }
        assert!(saw_title);

        h.controller.send("again", &[]).unwrap().wait().await.unwrap();
        assert_eq!(titles.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_session_skips_title() {
        let titles = Arc::new(FakeTitles::default());
        let mut h = harness(vec![MockResponse::Error(GatewayError::NetworkError("down".into()))]);
        h.controller = h.controller.with_titles(titles.clone());
        h.controller.send("hi", &[]).unwrap().wait().await.unwrap();
        assert!(titles.calls.lock().is_empty());
        assert_eq!(h.store.current().unwrap().title, "Chat 1");
    }

    #[tokio::test]
    async fn events_follow_lifecycle_order() {
        let h = harness(vec![MockResponse::stream_reasoned(&["t"], &["c"])]);
        let mut rx = h.controller.subscribe();
        h.controller.send("hi", &[]).unwrap().wait().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(
            kinds,
            vec!["started", "first_token", "reasoning_delta", "content_delta", "finished"]
        );
    }

    #[tokio::test]
    async fn writes_stay_on_target_after_switching_conversation() {
        let (tx, response) = MockResponse::channel();
        let h = harness(vec![response]);
        let target = h.store.current_id().unwrap();
        let mut rx = h.controller.subscribe();
        let handle = h.controller.send("hi", &[]).unwrap();
        tx.send(frame("x")).await.unwrap();
        content_deltas(&mut rx, 1).await;

        let other = h.store.create("normal", "", "Chat").unwrap();
        tx.send(frame("y")).await.unwrap();
        drop(tx);
        handle.wait().await.unwrap();

        assert_eq!(h.store.get(&target).unwrap().messages[1].text(), "xy");
        assert!(h.store.get(&other).unwrap().messages.is_empty());
    }
}
