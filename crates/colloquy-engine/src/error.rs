use colloquy_core::errors::GatewayError;
use colloquy_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("a generation is already in progress")]
    Busy,

    #[error("model not configured: {0}")]
    ModelNotConfigured(String),

    #[error("no conversation is selected")]
    NoConversation,

    #[error("cannot regenerate: {0}")]
    InvalidRegenerate(String),

    #[error("{0}")]
    Internal(String),
}
