use recall_core::errors::{ModelCallError, GENERIC_AI_ERROR};
use recall_core::ids::ConversationId;

/// A request rejected before any model call.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("request must contain a non-empty prompt or content")]
    EmptyRequest,

    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),

    #[error("content item {index} is {size} bytes, exceeding the {limit} byte limit")]
    ContentTooLarge { index: usize, size: usize, limit: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("model call failed: {0}")]
    ModelCall(#[from] ModelCallError),

    /// The stream consumer went away.
    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::ModelCall(e) => e.error_kind(),
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Text safe to show a caller. Model and internal failures never leak details.
    pub fn user_message(&self) -> String {
        match self {
            Self::ModelCall(e) => e.user_message().to_string(),
            Self::Internal(_) => GENERIC_AI_ERROR.to_string(),
            other => other.to_string(),
        }
    }
}
