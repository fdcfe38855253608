use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use recall_core::stream::{ParseResult, ParsedOutput, Thinking, ThinkingSource};
use recall_core::tools::{ToolArgs, ToolCall};

pub(crate) const THINK_OPEN: &str = "<think>";
pub(crate) const THINK_CLOSE: &str = "</think>";

/// A `</think>` with no opener is read as the end of a thinking region only
/// when it starts within this many bytes of the turn.
pub(crate) const LEADING_THINK_WINDOW: usize = 2048;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex"));

/// Parse one raw model turn. Never fails: unrecognised input becomes `PlainText`.
///
/// A non-empty `reasoning` (the provider's dedicated reasoning channel) wins
/// over any embedded `<think>` block; the block is stripped from the visible
/// text either way.
pub fn parse_response(raw: &str, reasoning: Option<&str>) -> ParseResult {
    let (visible, tag_thinking) = strip_thinking(raw);

    let thinking = match reasoning.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => Some(Thinking { content: r.to_string(), source: ThinkingSource::ReasoningField }),
        None => tag_thinking.map(|content| Thinking { content, source: ThinkingSource::EmbeddedTag }),
    };

    ParseResult { output: parse_visible(visible.trim()), thinking }
}

/// Remove every thinking region from `raw`, returning the visible text and the
/// joined thinking content.
pub fn strip_thinking(raw: &str) -> (String, Option<String>) {
    let mut parts: Vec<String> = Vec::new();
    let mut rest = raw;

    // Some providers drop the opening tag and start the turn inside the thinking region.
    if let Some(close) = rest.find(THINK_CLOSE).filter(|c| *c < LEADING_THINK_WINDOW) {
        let opens_before = rest.find(THINK_OPEN).is_some_and(|open| open < close);
        if !opens_before {
            parts.push(rest[..close].to_string());
            rest = &rest[close + THINK_CLOSE.len()..];
        }
    }

    let mut visible = String::with_capacity(rest.len());
    let mut last = 0;
    for caps in THINK_BLOCK.captures_iter(rest) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        visible.push_str(&rest[last..whole.start()]);
        parts.push(inner.as_str().to_string());
        last = whole.end();
    }
    let tail = &rest[last..];

    // Unclosed block: everything after the opener is thinking.
    match tail.find(THINK_OPEN) {
        Some(open) => {
            visible.push_str(&tail[..open]);
            parts.push(tail[open + THINK_OPEN.len()..].to_string());
        }
        None => visible.push_str(tail),
    }
    // Closers left over are stray.
    let visible = visible.replace(THINK_CLOSE, "");

    let joined = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    (visible, (!joined.is_empty()).then_some(joined))
}

/// A recognised JSON envelope.
#[derive(Debug, PartialEq)]
pub(crate) enum Envelope {
    ToolCalls(Vec<ToolCall>),
    Text(String),
}

/// Classify one JSON object. Anything that is not a known envelope returns `None`.
pub(crate) fn classify_envelope(value: &Value) -> Option<Envelope> {
    let obj = value.as_object()?;
    match obj.get("type").and_then(Value::as_str)? {
        "tool_calls" => {
            let calls = obj.get("calls").and_then(Value::as_array)?;
            Some(Envelope::ToolCalls(calls.iter().filter_map(parse_call).collect()))
        }
        "text_response" => ["response", "content", "text"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(|text| Envelope::Text(text.to_string())),
        _ => None,
    }
}

fn parse_call(value: &Value) -> Option<ToolCall> {
    let Some(name) = value.get("name").and_then(Value::as_str) else {
        debug!("skipping tool call without a name");
        return None;
    };
    let args = match value.get("args").or_else(|| value.get("arguments")) {
        None | Some(Value::Null) => ToolArgs::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            warn!(tool = name, args = %other, "skipping tool call with non-object arguments");
            return None;
        }
    };
    Some(ToolCall { name: name.to_string(), args })
}

fn parse_visible(visible: &str) -> ParsedOutput {
    let mut calls = Vec::new();
    let mut final_text: Option<String> = None;
    let mut prose = String::new();
    let mut last = 0;

    for (start, end, value) in json_objects(visible) {
        match classify_envelope(&value) {
            Some(Envelope::ToolCalls(found)) => calls.extend(found),
            Some(Envelope::Text(text)) => {
                final_text.get_or_insert(text);
            }
            None => continue,
        }
        prose.push_str(&visible[last..start]);
        last = end;
    }
    prose.push_str(&visible[last..]);

    if !calls.is_empty() {
        let discarded_text = match final_text {
            Some(text) => {
                warn!(
                    tool_calls = calls.len(),
                    "model turn contains both a final answer and tool calls; keeping tool calls"
                );
                Some(text)
            }
            None => Some(strip_fences(&prose)).filter(|p| !p.is_empty()),
        };
        return ParsedOutput::ToolCalls { calls, discarded_text };
    }

    match final_text {
        Some(text) => ParsedOutput::FinalText { text: text.trim().to_string() },
        None => ParsedOutput::PlainText { text: visible.to_string() },
    }
}

fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Incremental, string-aware brace matcher for one JSON object.
#[derive(Debug, Default)]
pub(crate) struct BraceScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl BraceScanner {
    /// Feed one character of an object that began with `{`. Returns true when
    /// that character closes the outermost object.
    pub(crate) fn feed(&mut self, c: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            return false;
        }
        match c {
            '"' => self.in_string = true,
            '{' => self.depth += 1,
            '}' => {
                self.depth = self.depth.saturating_sub(1);
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }
}

/// JSON objects in `text` with their byte spans. A `{` that never closes, or
/// whose balanced region is not valid JSON, is skipped and the scan resumes at
/// the next `{` after it.
fn json_objects(text: &str) -> Vec<(usize, usize, Value)> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        let parsed = balanced_len(&text[start..]).and_then(|len| {
            serde_json::from_str::<Value>(&text[start..start + len])
                .ok()
                .map(|value| (start + len, value))
        });
        match parsed {
            Some((end, value)) => {
                found.push((start, end, value));
                from = end;
            }
            None => from = start + 1,
        }
    }
    found
}

/// Byte length of the object opening at the start of `text`, if it closes.
fn balanced_len(text: &str) -> Option<usize> {
    let mut scanner = BraceScanner::default();
    text.char_indices()
        .find(|&(_, c)| scanner.feed(c))
        .map(|(i, c)| i + c.len_utf8())
}
