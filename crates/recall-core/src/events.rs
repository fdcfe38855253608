use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, RequestId, ToolCallId};
use crate::tools::{ToolArgs, ToolCallSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Starting,
    Executing,
    Completed,
    Error,
}

/// Outbound events of a streaming run, serialized one per SSE frame.
/// A stream ends with exactly one `Done` or `Error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "thought")]
    Thought { content: String },

    #[serde(rename = "tool-call", rename_all = "camelCase")]
    ToolCall {
        call_id: ToolCallId,
        name: String,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<ToolArgs>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "text-chunk")]
    TextChunk { content: String },

    #[serde(rename = "error")]
    Error { error: String },

    #[serde(rename = "done", rename_all = "camelCase")]
    Done {
        request_id: RequestId,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        total_tokens: u32,
        execution_time_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_content: Option<String>,
        tool_calls: Vec<ToolCallSummary>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::ToolCall { .. } => "tool-call",
            Self::TextChunk { .. } => "text-chunk",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// `data: <json>\n\n` framing.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}
