use std::time::Duration;

/// Typed error hierarchy for chat-completion transport.
/// Any of these ends a generation session in the errored phase, except
/// `Cancelled`, which is not surfaced to the user.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited: {body}")]
    RateLimited { retry_after: Option<Duration>, body: String },
    #[error("request failed: {status} {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Classify a non-2xx HTTP status into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None, body },
            _ => Self::ServerError { status, body },
        }
    }
}
