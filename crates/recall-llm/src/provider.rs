use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use recall_core::errors::ModelCallError;
use recall_core::messages::ChatMessage;
use recall_core::provider::{ByteStream, Completion, CompletionOptions, ModelProvider};

use crate::converter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
}

/// Chat-completions client for any OpenAI-compatible backend.
pub struct OpenAiCompatProvider {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ModelCallError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ModelCallError::NetworkError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model,
            api_key: config.api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<reqwest::Response, ModelCallError> {
        let body = converter::build_request_body(messages, options, &self.model, stream);

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&body);
        if stream {
            req = req.header("accept", "text/event-stream");
        }
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelCallError::Timeout(options.timeout)
            } else {
                ModelCallError::NetworkError(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelCallError::from_status(status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, ModelCallError> {
        let call = async {
            let resp = self.send(messages, options, false).await?;
            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| ModelCallError::MalformedResponse(e.to_string()))?;
            converter::parse_completion(body)
        };

        let completion = tokio::time::timeout(options.timeout, call)
            .await
            .map_err(|_| ModelCallError::Timeout(options.timeout))??;
        debug!(content_len = completion.content.len(), "completion received");
        Ok(completion)
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ByteStream, ModelCallError> {
        let resp = tokio::time::timeout(options.timeout, self.send(messages, options, true))
            .await
            .map_err(|_| ModelCallError::Timeout(options.timeout))??;

        let bytes = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ModelCallError::StreamInterrupted(e.to_string())));
        Ok(Box::pin(bytes))
    }
}
