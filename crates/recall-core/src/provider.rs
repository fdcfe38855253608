use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::errors::ModelCallError;
use crate::messages::ChatMessage;
use crate::tokens::TokenUsage;

/// Sampling and budget options for one model call.
#[derive(Clone, Debug)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Whole-call deadline, including the time to drain a stream.
    pub timeout: Duration,
    pub enable_thinking: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 4096,
            timeout: Duration::from_secs(180),
            enable_thinking: false,
        }
    }
}

/// Buffered result of one model call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Provider-supplied reasoning channel, when the model exposes one.
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Default::default() }
    }
}

/// Raw chat-completions SSE body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ModelCallError>> + Send>>;

/// Trait implemented by each model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, ModelCallError>;

    /// Open a streaming call. Errors before the first byte are returned here;
    /// later transport errors arrive as stream items.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ByteStream, ModelCallError>;
}
