use serde::{Deserialize, Serialize};

use crate::tokens::TokenUsage;
use crate::tools::ToolCall;

/// Where the thinking content of a model turn came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThinkingSource {
    ReasoningField,
    EmbeddedTag,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thinking {
    pub content: String,
    pub source: ThinkingSource,
}

/// What a model turn asked for.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedOutput {
    /// One or more tool-call envelopes. `discarded_text` holds a final answer
    /// found in the same turn, which loses to the tool calls.
    ToolCalls { calls: Vec<ToolCall>, discarded_text: Option<String> },
    /// A `{"type":"text_response"}` envelope.
    FinalText { text: String },
    /// Nothing structured was recognised; the visible text is the answer.
    PlainText { text: String },
}

/// Result of parsing one raw model turn. Parsing never fails.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseResult {
    pub output: ParsedOutput,
    pub thinking: Option<Thinking>,
}

impl ParseResult {
    pub fn has_tool_calls(&self) -> bool {
        matches!(&self.output, ParsedOutput::ToolCalls { calls, .. } if !calls.is_empty())
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.output {
            ParsedOutput::ToolCalls { calls, .. } => calls,
            _ => &[],
        }
    }

    /// The answer text of a terminal turn, or the text discarded in favour of tool calls.
    pub fn text_response(&self) -> Option<&str> {
        match &self.output {
            ParsedOutput::FinalText { text } | ParsedOutput::PlainText { text } => Some(text),
            ParsedOutput::ToolCalls { discarded_text, .. } => discarded_text.as_deref(),
        }
    }

    pub fn thinking_content(&self) -> Option<&str> {
        self.thinking.as_ref().map(|t| t.content.as_str())
    }

    pub fn thinking_source(&self) -> ThinkingSource {
        self.thinking.as_ref().map_or(ThinkingSource::None, |t| t.source)
    }
}

/// Semantic events produced by the stream decoder for one model call.
///
/// Ordering contract: (Reasoning | ThinkStart ThinkContent* ThinkEnd | Content | ToolCall)* Done
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedEvent {
    Reasoning { delta: String },
    ThinkStart,
    ThinkContent { delta: String },
    ThinkEnd,
    Content { delta: String },
    ToolCall { calls: Vec<ToolCall> },
    Done { result: ParseResult, usage: Option<TokenUsage> },
}

impl DecodedEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn calls() -> Vec<ToolCall> {
        vec![ToolCall::new("search_notes", Map::new())]
    }

    #[test]
    fn accessors_for_tool_calls() {
        let result = ParseResult {
            output: ParsedOutput::ToolCalls { calls: calls(), discarded_text: Some("hi".into()) },
            thinking: None,
        };
        assert!(result.has_tool_calls());
        assert_eq!(result.tool_calls().len(), 1);
        assert_eq!(result.text_response(), Some("hi"));
        assert_eq!(result.thinking_source(), ThinkingSource::None);
    }

    #[test]
    fn accessors_for_plain_text() {
        let result = ParseResult {
            output: ParsedOutput::PlainText { text: "answer".into() },
            thinking: Some(Thinking { content: "hmm".into(), source: ThinkingSource::EmbeddedTag }),
        };
        assert!(!result.has_tool_calls());
        assert!(result.tool_calls().is_empty());
        assert_eq!(result.text_response(), Some("answer"));
        assert_eq!(result.thinking_content(), Some("hmm"));
        assert_eq!(result.thinking_source(), ThinkingSource::EmbeddedTag);
    }

    #[test]
    fn thinking_source_serde() {
        let json = serde_json::to_string(&ThinkingSource::ReasoningField).unwrap();
        assert_eq!(json, r#""reasoning-field""#);
    }

    #[test]
    fn only_done_is_terminal() {
        let done = DecodedEvent::Done {
            result: ParseResult { output: ParsedOutput::PlainText { text: String::new() }, thinking: None },
            usage: None,
        };
        assert!(done.is_terminal());
        assert!(!DecodedEvent::ThinkStart.is_terminal());
    }
}
