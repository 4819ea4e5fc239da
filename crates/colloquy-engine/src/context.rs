use colloquy_core::context::RequestMessage;
use colloquy_core::messages::{Message, Role};

/// Appended to the system prompt ahead of formatted search results.
pub const SEARCH_INSTRUCTIONS: &str = "The following search results are related to the \
user's question and may be used to answer it. When citing them, use markdown links, for \
example: according to [Source 1](link)... so the user can open the original source:";

/// Turns a message log into the bounded `messages` array of a request.
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    context_count: usize,
    default_system_prompt: String,
}

impl ContextBuilder {
    pub fn new(context_count: usize, default_system_prompt: impl Into<String>) -> Self {
        Self {
            context_count,
            default_system_prompt: default_system_prompt.into(),
        }
    }

    pub fn context_count(&self) -> usize {
        self.context_count
    }

    /// One system message followed by at most `context_count` trailing
    /// messages of `log`. Only role and visible text are carried over.
    pub fn build(
        &self,
        system_prompt: &str,
        log: &[Message],
        search_results: Option<&str>,
    ) -> Vec<RequestMessage> {
        let mut system = if system_prompt.trim().is_empty() {
            self.default_system_prompt.clone()
        } else {
            system_prompt.to_string()
        };

        if let Some(results) = search_results.filter(|r| !r.trim().is_empty()) {
            system.push_str("\n\n");
            system.push_str(SEARCH_INSTRUCTIONS);
            system.push('\n');
            system.push_str(results);
        }

        let start = log.len().saturating_sub(self.context_count);
        if start > 0 {
            system.push_str(&format!(
                "\n\nThis conversation continues from earlier; {start} earlier turns are not shown."
            ));
        }

        let mut out = Vec::with_capacity(log.len() - start + 1);
        out.push(RequestMessage::new(Role::System, system));
        out.extend(
            log[start..]
                .iter()
                .map(|m| RequestMessage::new(m.role, m.text())),
        );
        out
    }
}
