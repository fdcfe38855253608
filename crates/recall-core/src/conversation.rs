use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, RequestId, UserId};
use crate::messages::{ChatMessage, Role};
use crate::tokens::TokenUsage;
use crate::tools::ToolCallSummary;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub message_count: u32,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub trace_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
}

/// A message as persisted. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sequence: i64,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallSummary>>,
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage { role: self.role, content: self.content.clone() }
    }
}

/// Input to [`ConversationStore::append_message`].
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub thinking_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallSummary>>,
    pub metadata: MessageMetadata,
}

impl NewMessage {
    pub fn new(conversation_id: ConversationId, role: Role, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role,
            content: content.into(),
            thinking_content: None,
            tool_calls: None,
            metadata: MessageMetadata::default(),
        }
    }
}

/// Read snapshot of a conversation held for the duration of one request.
#[derive(Clone, Debug)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    /// Oldest first.
    pub history: Vec<StoredMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationStoreError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Persistence collaborator for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation owned by `user_id` with its most recent `history_limit` messages.
    async fn load_conversation(
        &self,
        id: &ConversationId,
        user_id: &UserId,
        history_limit: usize,
    ) -> Result<Option<ConversationSnapshot>, ConversationStoreError>;

    async fn create_conversation(
        &self,
        user_id: &UserId,
        title: &str,
    ) -> Result<Conversation, ConversationStoreError>;

    async fn append_message(
        &self,
        message: NewMessage,
    ) -> Result<StoredMessage, ConversationStoreError>;

    async fn touch(&self, id: &ConversationId) -> Result<(), ConversationStoreError>;
}
