use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use recall_core::events::StreamEvent;
use recall_core::ids::{ConversationId, RequestId};
use recall_core::tokens::TokenUsage;
use recall_core::tools::ToolCallSummary;

use crate::trace::millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    TextResponse,
}

/// Buffered answer to a prompt request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    pub response: String,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
}

/// Everything a finished run produced, before it is shaped for a transport.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub request_id: RequestId,
    pub conversation_id: Option<ConversationId>,
    pub answer: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallSummary>,
    pub usage: TokenUsage,
    pub trace: Option<Value>,
    pub elapsed: Duration,
    pub model_calls: u32,
}

impl RunOutcome {
    pub fn into_response(self) -> PromptResponse {
        PromptResponse {
            response_type: ResponseType::TextResponse,
            response: self.answer,
            request_id: self.request_id,
            conversation_id: self.conversation_id,
            thinking_content: self.thinking,
            tool_calls: (!self.tool_calls.is_empty()).then_some(self.tool_calls),
            trace: self.trace,
        }
    }

    pub fn done_event(&self) -> StreamEvent {
        StreamEvent::Done {
            request_id: self.request_id.clone(),
            conversation_id: self.conversation_id.clone(),
            total_tokens: self.usage.total_tokens,
            execution_time_ms: millis(self.elapsed),
            thinking_content: self.thinking.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> RunOutcome {
        RunOutcome {
            request_id: RequestId::from_raw("req_1"),
            conversation_id: Some(ConversationId::from_raw("conv_1")),
            answer: "Sunny".into(),
            thinking: None,
            tool_calls: Vec::new(),
            usage: TokenUsage::new(10, 5),
            trace: None,
            elapsed: Duration::from_millis(42),
            model_calls: 1,
        }
    }

    #[test]
    fn response_shape() {
        let value = serde_json::to_value(outcome().into_response()).unwrap();
        assert_eq!(value["type"], "text_response");
        assert_eq!(value["response"], "Sunny");
        assert_eq!(value["requestId"], "req_1");
        assert_eq!(value["conversationId"], "conv_1");
        assert!(value.get("toolCalls").is_none());
        assert!(value.get("trace").is_none());
    }

    #[test]
    fn done_event_carries_totals() {
        match outcome().done_event() {
            StreamEvent::Done { total_tokens, execution_time_ms, tool_calls, .. } => {
                assert_eq!(total_tokens, 15);
                assert_eq!(execution_time_ms, 42);
                assert!(tool_calls.is_empty());
            }
            other => panic!("expected done, got {other:?}"),
        }
    }
}
