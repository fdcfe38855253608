use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;

use recall_core::errors::ModelCallError;
use recall_core::messages::ChatMessage;
use recall_core::provider::{ByteStream, Completion, CompletionOptions, ModelProvider};
use recall_core::tokens::TokenUsage;

/// Characters per synthesized SSE delta. Small enough to split tags and envelopes.
const STREAM_CHUNK_CHARS: usize = 5;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// A model turn. Served whole by `complete`, as SSE deltas by `stream`.
    Reply(Completion),
    /// Raw SSE body chunks, served only by `stream`.
    Chunks(Vec<String>),
    /// Return an error from the call itself.
    Error(ModelCallError),
    /// A stream that never produces a byte.
    Stall,
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(Completion {
            content: text.to_string(),
            reasoning: None,
            usage: Some(TokenUsage::new(10, 5)),
        })
    }

    pub fn text_with_reasoning(text: &str, reasoning: &str) -> Self {
        Self::Reply(Completion {
            content: text.to_string(),
            reasoning: Some(reasoning.to_string()),
            usage: Some(TokenUsage::new(10, 5)),
        })
    }

    /// A turn whose content is a `tool_calls` envelope.
    pub fn tool_calls(calls: serde_json::Value) -> Self {
        Self::text(&json!({"type": "tool_calls", "calls": calls}).to_string())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every prompt it was sent.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompts received so far, one entry per call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }

    async fn next_response(&self, messages: &[ChatMessage]) -> Result<MockResponse, ModelCallError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(messages.to_vec());

        let mut current = self.responses.lock().pop_front().ok_or_else(|| {
            ModelCallError::InvalidRequest(format!("MockProvider: no response configured for call {idx}"))
        })?;

        // Unroll nested delays iteratively.
        loop {
            match current {
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                MockResponse::Error(e) => return Err(e),
                other => return Ok(other),
            }
        }
    }
}

/// Render a completion as an OpenAI-style SSE body.
pub fn sse_chunks(completion: &Completion) -> Vec<String> {
    let mut frames = Vec::new();
    if let Some(reasoning) = &completion.reasoning {
        frames.push(delta_frame("reasoning_content", reasoning));
    }
    let chars: Vec<char> = completion.content.chars().collect();
    for piece in chars.chunks(STREAM_CHUNK_CHARS) {
        frames.push(delta_frame("content", &piece.iter().collect::<String>()));
    }
    if let Some(usage) = completion.usage {
        frames.push(format!(
            "data: {}\n\n",
            json!({"choices": [], "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            }})
        ));
    }
    frames.push("data: [DONE]\n\n".to_string());
    frames
}

fn delta_frame(field: &str, text: &str) -> String {
    format!("data: {}\n\n", json!({"choices": [{"delta": {field: text}}]}))
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<Completion, ModelCallError> {
        match self.next_response(messages).await? {
            MockResponse::Reply(completion) => Ok(completion),
            MockResponse::Stall => {
                std::future::pending::<()>().await;
                Err(ModelCallError::Cancelled)
            }
            _ => Err(ModelCallError::InvalidRequest(
                "MockProvider: raw chunks can only be streamed".into(),
            )),
        }
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<ByteStream, ModelCallError> {
        let chunks = match self.next_response(messages).await? {
            MockResponse::Reply(completion) => sse_chunks(&completion),
            MockResponse::Chunks(chunks) => chunks,
            MockResponse::Stall => {
                return Ok(Box::pin(futures::stream::pending::<Result<Bytes, ModelCallError>>()));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(..) => {
                return Err(ModelCallError::InvalidRequest("MockProvider: unresolved delay".into()));
            }
        };
        let items: Vec<Result<Bytes, ModelCallError>> =
            chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}
