use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use recall_core::ids::{RequestId, ToolCallId};
use recall_core::stream::ThinkingSource;
use recall_core::tokens::TokenUsage;
use recall_core::tools::ToolArgs;

/// One model call.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiCallTrace {
    pub call_index: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub model: String,
    pub streaming: bool,
    pub message_count: usize,
    /// `tool_calls`, `final_text`, `plain_text` or `error`.
    pub outcome: &'static str,
    pub tool_call_count: usize,
    pub thinking_source: ThinkingSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One tool execution.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallTrace {
    pub call_index: u32,
    pub call_id: ToolCallId,
    pub name: String,
    pub arguments: ToolArgs,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub result_summary: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub ai_call_count: usize,
    pub ai_call_ms: u64,
    pub tool_call_count: usize,
    pub tool_call_ms: u64,
    pub total_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub request_id: RequestId,
    pub ai_calls: Vec<AiCallTrace>,
    pub tool_calls: Vec<ToolCallTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TraceSummary>,
}

/// Append-only record of every model and tool call in one request.
pub struct TraceRecorder {
    trace: Trace,
    started: Instant,
}

impl TraceRecorder {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            trace: Trace {
                request_id,
                ai_calls: Vec::new(),
                tool_calls: Vec::new(),
                summary: None,
            },
            started: Instant::now(),
        }
    }

    pub fn record_ai_call(&mut self, call: AiCallTrace) {
        if self.is_finalized() {
            warn!(call_index = call.call_index, "ai call recorded after trace finalized, ignoring");
            return;
        }
        self.trace.ai_calls.push(call);
    }

    pub fn record_tool_call(&mut self, call: ToolCallTrace) {
        if self.is_finalized() {
            warn!(tool = %call.name, "tool call recorded after trace finalized, ignoring");
            return;
        }
        self.trace.tool_calls.push(call);
    }

    pub fn is_finalized(&self) -> bool {
        self.trace.summary.is_some()
    }

    /// Compute the summary. Only the first call has an effect.
    pub fn finalize(&mut self) -> TraceSummary {
        if let Some(summary) = self.trace.summary {
            warn!(request_id = %self.trace.request_id, "trace already finalized");
            return summary;
        }
        let summary = TraceSummary {
            ai_call_count: self.trace.ai_calls.len(),
            ai_call_ms: self.trace.ai_calls.iter().map(|c| c.duration_ms).sum(),
            tool_call_count: self.trace.tool_calls.len(),
            tool_call_ms: self.trace.tool_calls.iter().map(|c| c.duration_ms).sum(),
            total_ms: millis(self.started.elapsed()),
        };
        debug!(
            request_id = %self.trace.request_id,
            ai_calls = summary.ai_call_count,
            tool_calls = summary.tool_call_count,
            total_ms = summary.total_ms,
            "trace finalized"
        );
        self.trace.summary = Some(summary);
        summary
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn to_value(&self) -> Option<Value> {
        match serde_json::to_value(&self.trace) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "failed to serialize trace");
                None
            }
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
