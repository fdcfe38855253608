use serde::Deserialize;
use serde_json::{json, Value};

use recall_core::errors::ModelCallError;
use recall_core::messages::ChatMessage;
use recall_core::provider::{Completion, CompletionOptions};

use crate::decoder::UsagePayload;

/// Build an OpenAI-compatible chat-completions request body.
pub fn build_request_body(
    messages: &[ChatMessage],
    options: &CompletionOptions,
    model: &str,
    stream: bool,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": convert_messages(messages),
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
        "stream": stream,
    });

    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }

    // Reasoning models that expose a separate channel only fill it when asked.
    if options.enable_thinking {
        body["include_reasoning"] = json!(true);
    }

    body
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect()
}

#[derive(Deserialize)]
struct CompletionPayload {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Extract the first choice of a non-streaming response.
pub fn parse_completion(body: Value) -> Result<Completion, ModelCallError> {
    let payload: CompletionPayload =
        serde_json::from_value(body).map_err(|e| ModelCallError::MalformedResponse(e.to_string()))?;

    let choice = payload
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelCallError::MalformedResponse("response has no choices".into()))?;

    let reasoning = choice
        .message
        .reasoning
        .or(choice.message.reasoning_content)
        .filter(|r| !r.trim().is_empty());

    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        reasoning,
        usage: payload.usage.map(Into::into),
    })
}
