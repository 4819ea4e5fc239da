use serde::Deserialize;
use tracing::debug;

use colloquy_core::messages::MessageBody;
use colloquy_core::stream::{Phase, StreamEvent};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// State machine for an OpenAI-compatible chat-completion stream.
///
/// Bytes are fed in arbitrary chunks. A line is only parsed once its
/// terminating newline has arrived, so frames split across chunk boundaries
/// are reassembled; the trailing partial line is flushed by [`finish`].
///
/// [`finish`]: ChatStreamParser::finish
#[derive(Debug, Default)]
pub struct ChatStreamParser {
    phase: Phase,
    line_buf: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    utf8_tail: Vec<u8>,
    thinking: String,
    content: String,
    first_token_seen: bool,
}

impl ChatStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request dispatched; waiting for the first delta.
    pub fn begin(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::AwaitingFirstToken;
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Current buffers under the encoding rule.
    pub fn body(&self) -> MessageBody {
        MessageBody::from_parts(&self.thinking, &self.content)
    }

    /// Consume one chunk of the response body.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.phase.is_terminal() {
            return events;
        }
        self.decode_into_line_buf(chunk);

        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            self.process_line(&line, &mut events);
            if self.phase == Phase::Done {
                self.line_buf.clear();
                break;
            }
        }
        events
    }

    /// End of body. Flushes the partial last line and completes the stream
    /// if the sentinel never arrived.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.phase.is_terminal() {
            return events;
        }
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.line_buf.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.line_buf);
        self.process_line(&rest, &mut events);
        if self.phase != Phase::Done {
            self.phase = Phase::Done;
            events.push(StreamEvent::Done);
        }
        events
    }

    pub fn abort(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Aborted;
        }
    }

    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Errored;
        }
    }

    fn decode_into_line_buf(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);
        match std::str::from_utf8(&bytes) {
            Ok(text) => self.line_buf.push_str(text),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.line_buf
                    .push_str(&String::from_utf8_lossy(&bytes[..valid]));
                self.utf8_tail = bytes[valid..].to_vec();
            }
            Err(_) => self.line_buf.push_str(&String::from_utf8_lossy(&bytes)),
        }
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let Some(payload) = trimmed.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.phase = Phase::Done;
            events.push(StreamEvent::Done);
            return;
        }
        if payload.is_empty() {
            return;
        }

        let frame: ChunkFrame = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "skipping malformed stream frame");
                return;
            }
        };
        let Some(delta) = frame.choices.into_iter().next().and_then(|c| c.delta) else {
            return;
        };

        if let Some(reasoning) = delta.reasoning_content.filter(|s| !s.is_empty()) {
            self.note_first_token(events);
            if self.phase == Phase::AwaitingFirstToken {
                self.phase = Phase::Reasoning;
            }
            self.thinking.push_str(&reasoning);
            events.push(StreamEvent::ReasoningDelta { delta: reasoning });
        }
        if let Some(text) = delta.content.filter(|s| !s.is_empty()) {
            self.note_first_token(events);
            self.phase = Phase::Responding;
            self.content.push_str(&text);
            events.push(StreamEvent::ContentDelta { delta: text });
        }
    }

    fn note_first_token(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.first_token_seen {
            self.first_token_seen = true;
            events.push(StreamEvent::FirstToken);
        }
    }
}

#[derive(Deserialize)]
struct ChunkFrame {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}
