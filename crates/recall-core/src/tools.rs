use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::RequestContext;

/// Arguments of one tool call, in the order the model wrote them.
pub type ToolArgs = Map<String, Value>;

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: ToolArgs,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: ToolArgs) -> Self {
        Self { name: name.into(), args }
    }
}

/// Per-call record returned to the caller and stored with the assistant message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub function_name: String,
    pub execution_time_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub arguments: ToolArgs,
    pub result_summary: String,
}

const SUMMARY_STRING_LIMIT: usize = 100;

/// One-line human readable description of a tool result.
pub fn summarize_result(result: &Value) -> String {
    match result {
        Value::Array(items) => format!("Found {} items", items.len()),
        Value::Object(fields) => format!("Retrieved data with {} fields", fields.len()),
        Value::String(s) => {
            if s.chars().count() > SUMMARY_STRING_LIMIT {
                let cut: String = s.chars().take(SUMMARY_STRING_LIMIT).collect();
                format!("{cut}...")
            } else {
                s.clone()
            }
        }
        _ => "Operation completed".to_string(),
    }
}

/// Tool definition rendered into the system prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Trait implemented by each tool capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: ToolArgs, ctx: &RequestContext) -> Result<Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

/// Failure of one named tool call as seen by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("tool {name} failed: {message}")]
pub struct ToolExecutionError {
    pub name: String,
    pub message: String,
}

impl ToolExecutionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into() }
    }
}

/// Calling contract the orchestrator uses to run tools by name.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        args: ToolArgs,
        ctx: &RequestContext,
    ) -> Result<Value, ToolExecutionError>;

    /// Definitions of every callable tool, sorted by name.
    fn definitions(&self) -> Vec<ToolDefinition>;
}
