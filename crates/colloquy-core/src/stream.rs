use serde::{Deserialize, Serialize};

/// Semantic events produced from a chat-completion stream, in wire order.
///
/// FirstToken → (ReasoningDelta | ContentDelta)* → Done
///
/// `FirstToken` fires once, immediately before the first non-empty delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    FirstToken,
    ReasoningDelta { delta: String },
    ContentDelta { delta: String },
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Self::ReasoningDelta { .. } | Self::ContentDelta { .. })
    }
}

/// Lifecycle phase of a generation session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    AwaitingFirstToken,
    Reasoning,
    Responding,
    Done,
    Aborted,
    Errored,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingFirstToken => "awaiting_first_token",
            Self::Reasoning => "reasoning",
            Self::Responding => "responding",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::Done.is_terminal());
        let delta = StreamEvent::ContentDelta { delta: "x".into() };
        assert!(!delta.is_terminal());
        assert!(delta.is_delta());
        assert!(!StreamEvent::FirstToken.is_delta());
    }

    #[test]
    fn terminal_phases() {
        assert!(Phase::Done.is_terminal());
        assert!(Phase::Aborted.is_terminal());
        assert!(Phase::Errored.is_terminal());
        assert!(!Phase::Reasoning.is_terminal());
        assert!(!Phase::Idle.is_terminal());
    }

    #[test]
    fn phase_serde() {
        assert_eq!(
            serde_json::to_string(&Phase::AwaitingFirstToken).unwrap(),
            r#""awaiting_first_token""#
        );
        assert_eq!(Phase::Responding.to_string(), "responding");
    }
}
