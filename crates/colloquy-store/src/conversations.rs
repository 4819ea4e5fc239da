use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use colloquy_core::conversation::{AgeBucket, Conversation, ConversationGroup};
use colloquy_core::ids::ConversationId;
use colloquy_core::messages::{Message, MessageBody};

use crate::error::StoreError;
use crate::kv::KvStore;

pub const CONVERSATIONS_KEY: &str = "conversations";
pub const LAST_SELECTED_KEY: &str = "lastSelectedConversation";

const EVENT_CAPACITY: usize = 1024;

/// Change notifications for renderers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Created { id: ConversationId },
    Selected { id: Option<ConversationId> },
    Deleted { id: ConversationId },
    MessagesChanged { id: ConversationId },
    TitleChanged { id: ConversationId, title: String },
}

struct State {
    /// Creation order: `(created_at, id)` ascending.
    conversations: Vec<Conversation>,
    current: Option<ConversationId>,
}

impl State {
    fn position(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    fn current_mut(&mut self) -> Result<&mut Conversation, StoreError> {
        let id = self.current.clone().ok_or(StoreError::NoCurrentConversation)?;
        self.get_mut(&id).ok_or(StoreError::NoCurrentConversation)
    }
}

/// Owner of every conversation and of the current-conversation pointer.
///
/// Each mutation persists the full conversation map before returning;
/// `select` persists only the pointer. A mutation whose map write fails is
/// rolled back in memory, so memory never runs ahead of storage. The
/// pointer is written after the map. Operations addressed at a missing
/// conversation or index are no-ops and report `false`.
pub struct ConversationStore {
    kv: Arc<dyn KvStore>,
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    /// Load persisted conversations. The current pointer is restored from
    /// the last selection if it still exists, else the oldest conversation.
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let mut conversations: Vec<Conversation> = match kv.get(CONVERSATIONS_KEY)? {
            Some(Value::Object(map)) => map
                .into_iter()
                .filter_map(|(key, value)| match serde_json::from_value(value) {
                    Ok(conv) => Some(conv),
                    Err(e) => {
                        warn!(key, error = %e, "skipping unreadable conversation");
                        None
                    }
                })
                .collect(),
            Some(_) => {
                warn!("conversation map is not an object, starting empty");
                Vec::new()
            }
            None => Vec::new(),
        };
        conversations.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let last = kv
            .get(LAST_SELECTED_KEY)?
            .and_then(|v| v.as_str().map(ConversationId::from_raw));
        let current = last
            .filter(|id| conversations.iter().any(|c| &c.id == id))
            .or_else(|| conversations.first().map(|c| c.id.clone()));

        info!(count = conversations.len(), current = ?current, "conversation store loaded");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            kv,
            state: Mutex::new(State {
                conversations,
                current,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn save(&self, state: &State) -> Result<(), StoreError> {
        let mut map = serde_json::Map::with_capacity(state.conversations.len());
        for conv in &state.conversations {
            let _ = map.insert(conv.id.to_string(), serde_json::to_value(conv)?);
        }
        self.kv.set(CONVERSATIONS_KEY, &Value::Object(map))
    }

    /// Persist the map, undoing the in-memory change if the write fails.
    fn save_or_undo(
        &self,
        state: &mut State,
        undo: impl FnOnce(&mut State),
    ) -> Result<(), StoreError> {
        if let Err(e) = self.save(state) {
            warn!(error = %e, "conversation save failed, change rolled back");
            undo(state);
            return Err(e);
        }
        Ok(())
    }

    fn save_pointer(&self, state: &State) -> Result<(), StoreError> {
        match &state.current {
            Some(id) => self.kv.set(LAST_SELECTED_KEY, &Value::String(id.to_string())),
            None => self.kv.remove(LAST_SELECTED_KEY),
        }
    }

    // ── Conversations ───────────────────────────────────────────────

    /// Create an empty conversation titled `"{label} {n}"`, where `n` counts
    /// conversations of the same category, and select it.
    #[instrument(skip(self, system_prompt))]
    pub fn create(
        &self,
        category: &str,
        system_prompt: &str,
        category_label: &str,
    ) -> Result<ConversationId, StoreError> {
        let id = ConversationId::new();
        {
            let mut state = self.state.lock();
            let count = state
                .conversations
                .iter()
                .filter(|c| c.category == category)
                .count()
                + 1;
            let created_at = chrono::Utc::now()
                .timestamp_millis()
                .max(state.conversations.last().map_or(0, |c| c.created_at));
            state.conversations.push(Conversation {
                id: id.clone(),
                title: format!("{category_label} {count}"),
                messages: Vec::new(),
                system_prompt: system_prompt.to_string(),
                category: category.to_string(),
                created_at,
            });
            let previous = state.current.replace(id.clone());
            self.save_or_undo(&mut state, |state| {
                state.conversations.pop();
                state.current = previous;
            })?;
            self.save_pointer(&state)?;
        }
        debug!(conversation_id = %id, "conversation created");
        self.emit(StoreEvent::Created { id: id.clone() });
        self.emit(StoreEvent::Selected {
            id: Some(id.clone()),
        });
        Ok(id)
    }

    pub fn select(&self, id: &ConversationId) -> Result<bool, StoreError> {
        {
            let mut state = self.state.lock();
            if state.position(id).is_none() {
                return Ok(false);
            }
            state.current = Some(id.clone());
            self.save_pointer(&state)?;
        }
        self.emit(StoreEvent::Selected {
            id: Some(id.clone()),
        });
        Ok(true)
    }

    /// Remove a conversation. If it was current, the previous one in
    /// creation order becomes current, else the next, else none.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let reselected = {
            let mut state = self.state.lock();
            let Some(idx) = state.position(id) else {
                return Ok(false);
            };
            let removed = state.conversations.remove(idx);
            let previous = state.current.clone();

            let reselected = if previous.as_ref() == Some(id) {
                let next = idx
                    .checked_sub(1)
                    .and_then(|prev| state.conversations.get(prev))
                    .or_else(|| state.conversations.get(idx))
                    .map(|c| c.id.clone());
                state.current = next.clone();
                Some(next)
            } else {
                None
            };
            self.save_or_undo(&mut state, |state| {
                state.conversations.insert(idx, removed);
                state.current = previous;
            })?;
            if reselected.is_some() {
                self.save_pointer(&state)?;
            }
            reselected
        };
        self.emit(StoreEvent::Deleted { id: id.clone() });
        if let Some(current) = reselected {
            self.emit(StoreEvent::Selected { id: current });
        }
        Ok(true)
    }

    pub fn update_title(&self, id: &ConversationId, title: &str) -> Result<bool, StoreError> {
        {
            let mut state = self.state.lock();
            let Some(conv) = state.get_mut(id) else {
                return Ok(false);
            };
            let old = std::mem::replace(&mut conv.title, title.to_string());
            self.save_or_undo(&mut state, |state| {
                if let Some(conv) = state.get_mut(id) {
                    conv.title = old;
                }
            })?;
        }
        self.emit(StoreEvent::TitleChanged {
            id: id.clone(),
            title: title.to_string(),
        });
        Ok(true)
    }

    /// Replace the current conversation's system prompt.
    pub fn update_system_prompt(&self, prompt: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Ok(conv) = state.current_mut() else {
            return Ok(false);
        };
        let old = std::mem::replace(&mut conv.system_prompt, prompt.to_string());
        self.save_or_undo(&mut state, |state| {
            if let Ok(conv) = state.current_mut() {
                conv.system_prompt = old;
            }
        })?;
        Ok(true)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn current_id(&self) -> Option<ConversationId> {
        self.state.lock().current.clone()
    }

    pub fn current(&self) -> Option<Conversation> {
        let state = self.state.lock();
        let id = state.current.as_ref()?;
        state.conversations.iter().find(|c| &c.id == id).cloned()
    }

    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| &c.id == id)
            .cloned()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.state.lock().position(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().conversations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().conversations.len()
    }

    /// All conversations, newest first.
    pub fn list(&self) -> Vec<Conversation> {
        let state = self.state.lock();
        state.conversations.iter().rev().cloned().collect()
    }

    /// Newest-first conversations bucketed by age. Empty buckets are omitted.
    pub fn grouped(&self, now_ms: i64) -> Vec<ConversationGroup> {
        let mut groups: Vec<ConversationGroup> = Vec::new();
        for conv in self.list() {
            let bucket = AgeBucket::for_age(now_ms, conv.created_at);
            match groups.iter_mut().find(|g| g.bucket == bucket) {
                Some(group) => group.items.push(conv),
                None => groups.push(ConversationGroup {
                    bucket,
                    items: vec![conv],
                }),
            }
        }
        groups.sort_by_key(|g| match g.bucket {
            AgeBucket::Today => 0,
            AgeBucket::LastWeek => 1,
            AgeBucket::Earlier => 2,
        });
        groups
    }

    /// The last `n` messages of the current conversation, or all of them
    /// when the log is shorter.
    pub fn get_messages_for_context(&self, n: usize) -> Vec<Message> {
        match self.current_id() {
            Some(id) => self.messages_for_context_of(&id, n),
            None => Vec::new(),
        }
    }

    pub fn messages_for_context_of(&self, id: &ConversationId, n: usize) -> Vec<Message> {
        let state = self.state.lock();
        let Some(conv) = state.conversations.iter().find(|c| &c.id == id) else {
            return Vec::new();
        };
        let start = conv.messages.len().saturating_sub(n);
        conv.messages[start..].to_vec()
    }

    // ── Messages (current conversation) ─────────────────────────────

    /// Append to the current conversation.
    pub fn add_message(&self, message: Message) -> Result<(), StoreError> {
        let id = self.current_id().ok_or(StoreError::NoCurrentConversation)?;
        self.add_message_to(&id, message)
    }

    /// Overwrite the body of the current conversation's last message.
    pub fn update_last_message(&self, body: MessageBody) -> Result<(), StoreError> {
        let id = self.current_id().ok_or(StoreError::NoCurrentConversation)?;
        self.update_last_message_of(&id, body)
    }

    pub fn update_message(&self, index: usize, text: &str) -> Result<bool, StoreError> {
        self.mutate_current(|messages| match messages.get_mut(index) {
            Some(msg) => {
                msg.body = match std::mem::take(&mut msg.body) {
                    MessageBody::Reasoned { thinking, .. } => MessageBody::Reasoned {
                        thinking,
                        text: text.to_string(),
                    },
                    MessageBody::Plain(_) => MessageBody::Plain(text.to_string()),
                };
                true
            }
            None => false,
        })
    }

    pub fn delete_message(&self, index: usize) -> Result<bool, StoreError> {
        self.mutate_current(|messages| {
            if index < messages.len() {
                messages.remove(index);
                true
            } else {
                false
            }
        })
    }

    /// Truncate the current log to its first `index` messages.
    pub fn delete_messages_from(&self, index: usize) -> Result<bool, StoreError> {
        self.mutate_current(|messages| {
            if index < messages.len() {
                messages.truncate(index);
                true
            } else {
                false
            }
        })
    }

    pub fn clear_messages(&self) -> Result<bool, StoreError> {
        self.mutate_current(|messages| {
            let changed = !messages.is_empty();
            messages.clear();
            changed
        })
    }

    fn mutate_current<F>(&self, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Vec<Message>) -> bool,
    {
        let Some(id) = self.current_id() else {
            return Ok(false);
        };
        self.mutate_messages(&id, f)
    }

    // ── Messages (addressed) ────────────────────────────────────────

    pub fn add_message_to(&self, id: &ConversationId, message: Message) -> Result<(), StoreError> {
        let changed = self.mutate_messages(id, |messages| {
            messages.push(message);
            true
        })?;
        if changed {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    /// Overwrite the body of `id`'s last message. Fails if the conversation
    /// is gone or has no messages.
    pub fn update_last_message_of(
        &self,
        id: &ConversationId,
        body: MessageBody,
    ) -> Result<(), StoreError> {
        let changed = self.mutate_messages(id, |messages| match messages.last_mut() {
            Some(last) => {
                last.body = body;
                true
            }
            None => false,
        })?;
        if changed {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("last message of {id}")))
        }
    }

    /// Attach formatted search results to `id`'s last message.
    pub fn update_last_message_fields(
        &self,
        id: &ConversationId,
        search_results: Option<String>,
    ) -> Result<bool, StoreError> {
        self.mutate_messages(id, |messages| match messages.last_mut() {
            Some(last) => {
                last.search_results = search_results;
                true
            }
            None => false,
        })
    }

    /// Bulk replace a conversation's log.
    pub fn set_messages(
        &self,
        id: &ConversationId,
        messages: Vec<Message>,
    ) -> Result<bool, StoreError> {
        self.mutate_messages(id, |current| {
            *current = messages;
            true
        })
    }

    fn mutate_messages<F>(&self, id: &ConversationId, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Vec<Message>) -> bool,
    {
        {
            let mut state = self.state.lock();
            let Some(conv) = state.get_mut(id) else {
                return Ok(false);
            };
            let mut draft = conv.messages.clone();
            if !f(&mut draft) {
                return Ok(false);
            }
            let old = std::mem::replace(&mut conv.messages, draft);
            self.save_or_undo(&mut state, |state| {
                if let Some(conv) = state.get_mut(id) {
                    conv.messages = old;
                }
            })?;
        }
        self.emit(StoreEvent::MessagesChanged { id: id.clone() });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use colloquy_core::messages::Role;

    fn store() -> (Arc<MemoryKv>, ConversationStore) {
        let kv = Arc::new(MemoryKv::new());
        let store = ConversationStore::open(kv.clone()).unwrap();
        (kv, store)
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text().to_string()).collect()
    }

    #[test]
    fn create_titles_count_per_category() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        let b = store.create("translator", "t", "Translator").unwrap();
        let c = store.create("normal", "p", "Chat").unwrap();

        assert_eq!(store.get(&a).unwrap().title, "Chat 1");
        assert_eq!(store.get(&b).unwrap().title, "Translator 1");
        assert_eq!(store.get(&c).unwrap().title, "Chat 2");
        assert_eq!(store.current_id(), Some(c));
        assert_eq!(store.get(&b).unwrap().system_prompt, "t");
    }

    #[test]
    fn create_persists_and_reloads() {
        let (kv, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.add_message(Message::user("hello")).unwrap();
        let b = store.create("normal", "p", "Chat").unwrap();
        store.select(&a).unwrap();

        let reloaded = ConversationStore::open(kv).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.current_id(), Some(a.clone()));
        assert_eq!(texts(&reloaded.get(&a).unwrap().messages), vec!["hello"]);
        assert!(reloaded.contains(&b));
    }

    #[test]
    fn reload_falls_back_to_oldest() {
        let (kv, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.create("normal", "p", "Chat").unwrap();
        kv.set(LAST_SELECTED_KEY, &Value::String("conv_gone".into()))
            .unwrap();

        let reloaded = ConversationStore::open(kv).unwrap();
        assert_eq!(reloaded.current_id(), Some(a));
    }

    #[test]
    fn select_unknown_is_noop() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        assert!(!store.select(&ConversationId::from_raw("conv_missing")).unwrap());
        assert_eq!(store.current_id(), Some(a));
    }

    #[test]
    fn delete_current_selects_previous_then_next_then_none() {
        let (kv, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        let b = store.create("normal", "p", "Chat").unwrap();
        let c = store.create("normal", "p", "Chat").unwrap();

        store.select(&b).unwrap();
        assert!(store.delete(&b).unwrap());
        assert_eq!(store.current_id(), Some(a.clone()));

        assert!(store.delete(&a).unwrap());
        assert_eq!(store.current_id(), Some(c.clone()));

        assert!(store.delete(&c).unwrap());
        assert_eq!(store.current_id(), None);
        assert!(store.is_empty());
        assert!(kv.get(LAST_SELECTED_KEY).unwrap().is_none());
    }

    #[test]
    fn delete_non_current_keeps_pointer() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        let b = store.create("normal", "p", "Chat").unwrap();
        assert!(store.delete(&a).unwrap());
        assert_eq!(store.current_id(), Some(b));
        assert!(!store.delete(&a).unwrap());
    }

    #[test]
    fn context_window_is_trailing_slice() {
        let (_, store) = store();
        store.create("normal", "p", "Chat").unwrap();
        for len in 0..7usize {
            for n in 1..9usize {
                let window = store.get_messages_for_context(n);
                let all = store.current().unwrap().messages;
                assert_eq!(window.len(), n.min(len));
                assert_eq!(window[..], all[len - window.len()..]);
            }
            store.add_message(Message::user(format!("m{len}"))).unwrap();
        }
        assert_eq!(
            texts(&store.get_messages_for_context(3)),
            vec!["m4", "m5", "m6"]
        );
    }

    #[test]
    fn add_message_without_current_fails() {
        let (_, store) = store();
        assert!(matches!(
            store.add_message(Message::user("x")),
            Err(StoreError::NoCurrentConversation)
        ));
        assert!(matches!(
            store.update_last_message(MessageBody::Plain("x".into())),
            Err(StoreError::NoCurrentConversation)
        ));
    }

    #[test]
    fn addressed_writes_ignore_selection() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.add_message(Message::user("q")).unwrap();
        store.add_message(Message::placeholder()).unwrap();
        let b = store.create("normal", "p", "Chat").unwrap();

        store
            .update_last_message_of(&a, MessageBody::Plain("answer".into()))
            .unwrap();
        assert_eq!(texts(&store.get(&a).unwrap().messages), vec!["q", "answer"]);
        assert!(store.get(&b).unwrap().messages.is_empty());
        assert_eq!(store.current_id(), Some(b));
    }

    #[test]
    fn addressed_writes_to_missing_target_fail() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        assert!(matches!(
            store.update_last_message_of(&a, MessageBody::empty()),
            Err(StoreError::NotFound(_))
        ));
        store.delete(&a).unwrap();
        assert!(matches!(
            store.add_message_to(&a, Message::user("x")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn index_edits() {
        let (_, store) = store();
        store.create("normal", "p", "Chat").unwrap();
        for t in ["a", "b", "c", "d"] {
            store.add_message(Message::user(t)).unwrap();
        }
        assert!(store.update_message(1, "B").unwrap());
        assert!(!store.update_message(9, "x").unwrap());
        assert!(store.delete_message(0).unwrap());
        assert!(!store.delete_message(9).unwrap());
        assert_eq!(texts(&store.current().unwrap().messages), vec!["B", "c", "d"]);

        assert!(store.delete_messages_from(1).unwrap());
        assert_eq!(texts(&store.current().unwrap().messages), vec!["B"]);
        assert!(!store.delete_messages_from(5).unwrap());

        assert!(store.clear_messages().unwrap());
        assert!(store.current().unwrap().messages.is_empty());
    }

    #[test]
    fn update_message_keeps_reasoning() {
        let (_, store) = store();
        store.create("normal", "p", "Chat").unwrap();
        store
            .add_message(Message::assistant(MessageBody::from_parts("why", "what")))
            .unwrap();
        store.update_message(0, "edited").unwrap();
        let msg = &store.current().unwrap().messages[0];
        assert_eq!(msg.body.thinking(), Some("why"));
        assert_eq!(msg.text(), "edited");
    }

    #[test]
    fn title_system_prompt_and_search_fields() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.add_message(Message::user("q")).unwrap();

        assert!(store.update_title(&a, "Renamed").unwrap());
        assert!(store.update_system_prompt("be terse").unwrap());
        assert!(store
            .update_last_message_fields(&a, Some("Source 1: x".into()))
            .unwrap());

        let conv = store.get(&a).unwrap();
        assert_eq!(conv.title, "Renamed");
        assert_eq!(conv.system_prompt, "be terse");
        assert_eq!(conv.messages[0].search_results.as_deref(), Some("Source 1: x"));
        assert!(!store
            .update_title(&ConversationId::from_raw("conv_x"), "t")
            .unwrap());
    }

    #[test]
    fn set_messages_replaces_log() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.add_message(Message::user("old")).unwrap();
        store
            .set_messages(&a, vec![Message::user("n1"), Message::assistant(MessageBody::Plain("n2".into()))])
            .unwrap();
        let conv = store.get(&a).unwrap();
        assert_eq!(texts(&conv.messages), vec!["n1", "n2"]);
        assert_eq!(conv.messages[1].role, Role::Assistant);
    }

    #[test]
    fn list_newest_first_and_grouped() {
        let (_, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        let b = store.create("normal", "p", "Chat").unwrap();
        let ids: Vec<_> = store.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.clone(), a.clone()]);

        let created = store.get(&a).unwrap().created_at;
        let groups = store.grouped(created + 1000);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].bucket, AgeBucket::Today);
        assert_eq!(groups[0].items.len(), 2);

        let groups = store.grouped(created + 30 * 24 * 60 * 60 * 1000);
        assert_eq!(groups[0].bucket, AgeBucket::Earlier);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let (_, store) = store();
        let mut rx = store.subscribe();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.add_message(Message::user("x")).unwrap();
        store.update_title(&a, "T").unwrap();
        store.delete(&a).unwrap();

        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Created { id: a.clone() });
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Selected { id: Some(a.clone()) });
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::MessagesChanged { id: a.clone() });
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::TitleChanged { id: a.clone(), title: "T".into() }
        );
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Deleted { id: a });
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Selected { id: None });
    }

    #[test]
    fn persisted_as_map_keyed_by_id() {
        let (kv, store) = store();
        let a = store.create("normal", "p", "Chat").unwrap();
        let map = kv.get(CONVERSATIONS_KEY).unwrap().unwrap();
        assert_eq!(map[a.as_str()]["title"], "Chat 1");
        assert_eq!(map[a.as_str()]["type"], "normal");
        assert_eq!(
            kv.get(LAST_SELECTED_KEY).unwrap(),
            Some(Value::String(a.to_string()))
        );
    }

    /// Memory-backed store whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyKv {
        inner: MemoryKv,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyKv {
        fn fail(&self, on: bool) {
            self.failing.store(on, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl KvStore for FlakyKv {
        fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn failed_writes_leave_memory_matching_storage() {
        let kv = Arc::new(FlakyKv::default());
        let store = ConversationStore::open(kv.clone()).unwrap();
        let a = store.create("normal", "p", "Chat").unwrap();
        store.add_message(Message::user("kept")).unwrap();

        kv.fail(true);
        assert!(store.create("normal", "p", "Chat").is_err());
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_id(), Some(a.clone()));

        assert!(store.add_message(Message::user("lost")).is_err());
        assert!(store.update_title(&a, "renamed").is_err());
        assert!(store.update_system_prompt("other").is_err());
        assert!(store.delete(&a).is_err());

        let conv = store.current().unwrap();
        assert_eq!(texts(&conv.messages), vec!["kept"]);
        assert_eq!(conv.title, "Chat 1");
        assert_eq!(conv.system_prompt, "p");

        kv.fail(false);
        let reopened = ConversationStore::open(kv.clone()).unwrap();
        assert_eq!(reopened.current().unwrap(), conv);
    }
}
