use std::fmt::Write;

use serde_json::{json, Value};

use recall_core::tools::{ToolCall, ToolDefinition};

use crate::assets::ResolvedAsset;

pub const FALLBACK_ANSWER: &str =
    "I wasn't able to put together an answer for that. Could you try rephrasing your request?";

pub const TOOL_ERROR_GUIDANCE: &str = "There was an error executing one or more tools. \
Use the results you have and respond to the user now, without making more tool calls. \
Mention briefly what could not be completed.";

pub const FINAL_ANSWER_NOTE: &str = "You have reached the limit of tool calls for this request. \
Give your final answer to the user now as plain text. Do not request any more tools.";

pub const DEFAULT_ASSET_PROMPT: &str = "Please review the attached content.";

const TITLE_MAX_CHARS: usize = 50;
const DEFAULT_TITLE: &str = "New conversation";

const BASE_INSTRUCTIONS: &str = "You are Recall, a personal knowledge assistant. \
The user keeps bookmarks, documents, photos, tasks and notes with you. \
Answer accurately and concisely, and say so when you do not know something.";

const TOOL_FORMAT: &str = r#"When you need a tool, reply with only this JSON object and nothing else:
{"type":"tool_calls","calls":[{"name":"<tool name>","args":{...}}]}
You may put several calls in one object; they run in the order given.
Tool results come back to you as a JSON array. When you have what you need, reply with:
{"type":"text_response","response":"<your answer>"}
or simply with your answer as plain text."#;

const THINKING_INSTRUCTIONS: &str =
    "Think through the request step by step inside <think></think> tags before answering.";

/// Inputs to the system prompt of one run.
pub struct SystemPrompt<'a> {
    pub tools: &'a [ToolDefinition],
    pub include_tools: bool,
    pub enable_thinking: bool,
    pub assets: &'a [ResolvedAsset],
}

impl SystemPrompt<'_> {
    pub fn render(&self) -> String {
        let mut out = String::from(BASE_INSTRUCTIONS);

        if self.include_tools && !self.tools.is_empty() {
            out.push_str("\n\n## Tools\n");
            for tool in self.tools {
                let _ = writeln!(
                    out,
                    "- {}: {}\n  parameters: {}",
                    tool.name, tool.description, tool.parameters_schema
                );
            }
            out.push('\n');
            out.push_str(TOOL_FORMAT);
        } else {
            out.push_str("\n\nAnswer directly in plain text.");
        }

        if self.enable_thinking {
            out.push_str("\n\n");
            out.push_str(THINKING_INSTRUCTIONS);
        }

        if !self.assets.is_empty() {
            out.push_str("\n\n## Attached content\n");
            for asset in self.assets {
                let _ = write!(out, "\n### {} ({})\n{}\n", asset.label, asset.kind, asset.text);
            }
        }

        out
    }
}

/// Canonical envelope text for an assistant turn that requested tools.
pub fn tool_calls_envelope(calls: &[ToolCall]) -> String {
    json!({"type": "tool_calls", "calls": calls}).to_string()
}

/// One fed-back entry per executed call.
pub fn tool_result_entry(tool_name: &str, result: Result<&Value, &str>) -> Value {
    match result {
        Ok(value) => json!({"tool_name": tool_name, "result": value}),
        Err(error) => json!({"tool_name": tool_name, "result": Value::Null, "error": error}),
    }
}

/// Body of the synthetic user turn carrying tool results, in call order.
pub fn tool_results_message(entries: Vec<Value>) -> String {
    Value::Array(entries).to_string()
}

/// Title for a new conversation: the first line of the prompt, shortened.
pub fn conversation_title(prompt: &str) -> String {
    let first_line = prompt.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if first_line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// Whether a final answer is a bare JSON object or array rather than prose.
pub fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    let bracketed = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    bracketed && serde_json::from_str::<Value>(trimmed).is_ok()
}
