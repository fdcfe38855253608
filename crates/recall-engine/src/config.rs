use std::time::Duration;

use recall_core::provider::CompletionOptions;

pub const DEFAULT_MAX_MODEL_CALLS: u32 = 10;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Tunables for one orchestrator instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on model calls for a non-assets request. Values above
    /// [`DEFAULT_MAX_MODEL_CALLS`] are clamped.
    pub max_model_calls: u32,
    pub model_timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Tool calls of one iteration run with at most this many in flight. 1 = sequential.
    pub tool_concurrency: usize,
    pub tool_timeout: Duration,
    /// Most recent history messages included in the prompt.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_model_calls: DEFAULT_MAX_MODEL_CALLS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            temperature: 0.2,
            max_tokens: 4096,
            tool_concurrency: 1,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Model calls a non-assets run may make, always within `1..=10`.
    pub fn model_call_limit(&self) -> u32 {
        self.max_model_calls.clamp(1, DEFAULT_MAX_MODEL_CALLS)
    }

    pub fn completion_options(&self, enable_thinking: bool) -> CompletionOptions {
        CompletionOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: self.model_timeout,
            enable_thinking,
        }
    }
}
