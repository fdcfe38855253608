use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use recall_core::context::RequestContext;
use recall_core::conversation::{
    Conversation, ConversationSnapshot, ConversationStore, ConversationStoreError, MessageMetadata, NewMessage,
};
use recall_core::errors::ModelCallError;
use recall_core::events::StreamEvent;
use recall_core::ids::{ConversationId, UserId};
use recall_core::messages::{ChatMessage, Role};
use recall_core::provider::{CompletionOptions, ModelProvider};
use recall_core::stream::{DecodedEvent, ParseResult, ParsedOutput, ThinkingSource};
use recall_core::tokens::TokenUsage;
use recall_core::tools::{ToolCallSummary, ToolExecutor};
use recall_llm::{parse_response, DecodedStream};

use crate::assets::{resolve_assets, AssetFetcher, InlineOnlyFetcher};
use crate::config::EngineConfig;
use crate::dispatch::ToolDispatcher;
use crate::error::EngineError;
use crate::locks::{ConversationLease, ConversationLocks};
use crate::prompt::{
    conversation_title, looks_like_json, tool_calls_envelope, tool_results_message, SystemPrompt,
    DEFAULT_ASSET_PROMPT, FALLBACK_ANSWER, FINAL_ANSWER_NOTE, TOOL_ERROR_GUIDANCE,
};
use crate::request::PromptRequest;
use crate::response::{PromptResponse, RunOutcome};
use crate::streaming::{terminal_event, EventSink};
use crate::trace::{millis, AiCallTrace, TraceRecorder};

/// Step of a run, logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    LoadingContext,
    AssetResolution,
    CallingModel,
    Parsing,
    ExecutingTools,
    Finalizing,
    Done,
    Failed,
}

/// Mutable state of one request.
struct Run {
    request: PromptRequest,
    ctx: RequestContext,
    conversation: Option<Conversation>,
    messages: Vec<ChatMessage>,
    assets_mode: bool,
    state: RunState,
    trace: TraceRecorder,
    usage: TokenUsage,
    thinking: Vec<String>,
    summaries: Vec<ToolCallSummary>,
    call_index: u32,
    tool_failure_seen: bool,
    started: Instant,
    _lease: Option<ConversationLease>,
}

impl Run {
    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }
}

/// One parsed model turn.
struct ModelTurn {
    result: ParseResult,
    usage: Option<TokenUsage>,
    /// The visible text already reached the stream consumer as text chunks.
    streamed_text: bool,
}

/// Drives prompt requests: model calls interleaved with tool executions,
/// answered in one piece or as a live event stream.
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<dyn ToolExecutor>,
    store: Arc<dyn ConversationStore>,
    assets: Arc<dyn AssetFetcher>,
    config: EngineConfig,
    locks: ConversationLocks,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<dyn ToolExecutor>,
        store: Arc<dyn ConversationStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            assets: Arc::new(InlineOnlyFetcher),
            config,
            locks: ConversationLocks::new(),
        }
    }

    pub fn with_asset_fetcher(mut self, assets: Arc<dyn AssetFetcher>) -> Self {
        self.assets = assets;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Conversations with a run in flight or queued.
    pub fn active_conversations(&self) -> usize {
        self.locks.active()
    }

    /// Run a prompt to completion and return the buffered answer.
    pub async fn run(
        &self,
        request: PromptRequest,
        ctx: RequestContext,
    ) -> Result<PromptResponse, EngineError> {
        let span = run_span(&ctx, false);
        async move {
            let mut run = self.prepare(request, ctx).await?;
            let result = self.execute(&mut run, None).await;
            self.finish(run, result).await.map(RunOutcome::into_response)
        }
        .instrument(span)
        .await
    }

    /// Start a streaming run. Validation and conversation lookup failures are
    /// returned here; everything after arrives on the receiver, which always
    /// ends with one `done` or `error` event unless the receiver was dropped.
    pub async fn run_streaming(
        self: &Arc<Self>,
        request: PromptRequest,
        ctx: RequestContext,
    ) -> Result<mpsc::Receiver<StreamEvent>, EngineError> {
        let span = run_span(&ctx, true);
        let mut run = self.prepare(request, ctx).instrument(span.clone()).await?;
        let (sink, rx) = EventSink::channel();
        let this = Arc::clone(self);

        tokio::spawn(
            async move {
                let result = this.execute(&mut run, Some(&sink)).await;
                let result = this.finish(run, result).await;
                if let Some(event) = terminal_event(&result, RunOutcome::done_event) {
                    if sink.send(event).await.is_err() {
                        debug!("consumer left before the terminal event");
                    }
                }
            }
            .instrument(span),
        );

        Ok(rx)
    }

    async fn prepare(&self, request: PromptRequest, ctx: RequestContext) -> Result<Run, EngineError> {
        let conversation_id = request.validate()?;
        if let Some(id) = &conversation_id {
            Span::current().record("conversation_id", tracing::field::display(id));
        }

        // Ownership is checked before queueing behind the conversation's lease;
        // history is read again once the lease is held.
        let (lease, history) = match &conversation_id {
            Some(id) => {
                self.load_snapshot(id, &ctx.user_id).await?;
                let lease = self.locks.acquire(id).await;
                (Some(lease), Some(self.load_snapshot(id, &ctx.user_id).await?))
            }
            None => (None, None),
        };

        let mut run = Run {
            trace: TraceRecorder::new(ctx.request_id.clone()),
            request,
            ctx,
            conversation: None,
            messages: Vec::new(),
            assets_mode: false,
            state: RunState::LoadingContext,
            usage: TokenUsage::default(),
            thinking: Vec::new(),
            summaries: Vec::new(),
            call_index: 0,
            tool_failure_seen: false,
            started: Instant::now(),
            _lease: lease,
        };
        debug!(state = ?run.state, "run started");

        let history = match history {
            Some(snapshot) => {
                run.conversation = Some(snapshot.conversation);
                snapshot.history
            }
            None => Vec::new(),
        };

        let mut refs = run.request.content.clone();
        refs.extend(run.request.context.assets.iter().cloned());
        if !refs.is_empty() {
            run.transition(RunState::AssetResolution);
        }
        let assets = resolve_assets(self.assets.as_ref(), &refs, &run.ctx.user_id).await;
        run.assets_mode = assets.iter().any(|a| !a.placeholder);

        let include_tools = !run.assets_mode || run.request.context.background_task_execution;
        let tools = if include_tools {
            self.tools.definitions()
        } else {
            Vec::new()
        };
        let system = SystemPrompt {
            tools: &tools,
            include_tools,
            enable_thinking: run.request.enable_thinking,
            assets: &assets,
        }
        .render();

        let user_text = match run.request.prompt_text() {
            "" => DEFAULT_ASSET_PROMPT.to_string(),
            text => text.to_string(),
        };

        run.messages.push(ChatMessage::system(system));
        run.messages.extend(history.iter().map(|m| m.to_chat()));
        run.messages.push(ChatMessage::user(user_text));

        debug!(
            history = history.len(),
            assets = assets.len(),
            assets_mode = run.assets_mode,
            tools = tools.len(),
            "context loaded"
        );
        Ok(run)
    }

    async fn load_snapshot(
        &self,
        id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationSnapshot, EngineError> {
        self.store
            .load_conversation(id, user_id, self.config.history_limit)
            .await
            .map_err(|e| match e {
                ConversationStoreError::NotFound(_) => EngineError::ConversationNotFound(id.clone()),
                ConversationStoreError::Storage(msg) => EngineError::Internal(format!("load conversation: {msg}")),
            })?
            .ok_or_else(|| EngineError::ConversationNotFound(id.clone()))
    }

    async fn execute(&self, run: &mut Run, events: Option<&EventSink>) -> Result<RunOutcome, EngineError> {
        let options = self.config.completion_options(run.request.enable_thinking);
        let max_calls = if run.assets_mode {
            1
        } else {
            self.config.model_call_limit()
        };
        let dispatcher = ToolDispatcher::new(Arc::clone(&self.tools), self.config.tool_concurrency);
        let mut last_prose: Option<String> = None;

        let (answer, streamed) = loop {
            if events.is_some_and(EventSink::is_closed) {
                return Err(EngineError::Cancelled);
            }

            run.call_index += 1;
            let closing = run.call_index == max_calls;
            if closing && run.call_index > 1 {
                run.messages.push(ChatMessage::system(FINAL_ANSWER_NOTE));
            }

            run.transition(RunState::CallingModel);
            let turn = self.call_model(run, &options, events).await?;

            run.transition(RunState::Parsing);
            if let Some(thinking) = turn.result.thinking_content() {
                run.thinking.push(thinking.to_string());
            }
            let text = turn
                .result
                .text_response()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from);

            match turn.result.output {
                ParsedOutput::FinalText { .. } | ParsedOutput::PlainText { .. } => {
                    break (text.unwrap_or_default(), turn.streamed_text);
                }
                ParsedOutput::ToolCalls { calls, .. } if run.assets_mode => {
                    warn!(tool_calls = calls.len(), "tool calls requested in assets mode, returning raw output");
                    break (text.unwrap_or_else(|| tool_calls_envelope(&calls)), false);
                }
                ParsedOutput::ToolCalls { calls, .. } if closing => {
                    warn!(
                        tool_calls = calls.len(),
                        call_index = run.call_index,
                        "closing model call still requested tools"
                    );
                    break (text.or(last_prose).unwrap_or_default(), false);
                }
                ParsedOutput::ToolCalls { calls, .. } => {
                    if text.is_some() {
                        last_prose = text;
                    }

                    run.transition(RunState::ExecutingTools);
                    let outcomes = dispatcher.dispatch(&calls, &run.ctx, events).await?;

                    let mut feedback = Vec::with_capacity(outcomes.len());
                    let mut any_failed = false;
                    for outcome in &outcomes {
                        run.trace.record_tool_call(outcome.trace(run.call_index));
                        run.summaries.push(outcome.summary());
                        feedback.push(outcome.feedback());
                        any_failed |= !outcome.succeeded();
                    }

                    run.messages.push(ChatMessage::assistant(tool_calls_envelope(&calls)));
                    run.messages.push(ChatMessage::user(tool_results_message(feedback)));
                    if any_failed && !run.tool_failure_seen {
                        run.tool_failure_seen = true;
                        run.messages.push(ChatMessage::system(TOOL_ERROR_GUIDANCE));
                    }
                }
            }
        };

        run.transition(RunState::Finalizing);
        let answer = if answer.is_empty() {
            warn!(model_calls = run.call_index, "empty final answer, using fallback");
            FALLBACK_ANSWER.to_string()
        } else {
            if looks_like_json(&answer) {
                warn!("final answer looks like raw JSON");
            }
            answer
        };
        if let Some(sink) = events {
            if !streamed || answer == FALLBACK_ANSWER {
                sink.send(StreamEvent::TextChunk { content: answer.clone() }).await?;
            }
        }

        let summary = run.trace.finalize();
        let trace_value = if run.request.trace { run.trace.to_value() } else { None };
        let conversation_id = self.persist(run, &answer, trace_value.clone()).await;

        info!(
            model_calls = run.call_index,
            tool_calls = summary.tool_call_count,
            total_tokens = run.usage.total_tokens,
            total_ms = summary.total_ms,
            "prompt completed"
        );

        let thinking = (!run.thinking.is_empty()).then(|| run.thinking.join("\n\n"));
        Ok(RunOutcome {
            request_id: run.ctx.request_id.clone(),
            conversation_id,
            answer,
            thinking,
            tool_calls: run.summaries.clone(),
            usage: run.usage,
            trace: trace_value,
            elapsed: run.started.elapsed(),
            model_calls: run.call_index,
        })
    }

    #[instrument(skip_all, fields(call_index = run.call_index, streaming = events.is_some()))]
    async fn call_model(
        &self,
        run: &mut Run,
        options: &CompletionOptions,
        events: Option<&EventSink>,
    ) -> Result<ModelTurn, EngineError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let result = match events {
            None => self.call_buffered(&run.messages, options).await,
            Some(sink) => {
                self.call_streaming(&run.messages, options, sink, run.request.enable_thinking)
                    .await
            }
        };

        let mut trace = AiCallTrace {
            call_index: run.call_index,
            started_at,
            duration_ms: millis(started.elapsed()),
            model: self.provider.model().to_string(),
            streaming: events.is_some(),
            message_count: run.messages.len(),
            outcome: "error",
            tool_call_count: 0,
            thinking_source: ThinkingSource::None,
            usage: None,
            error: None,
        };

        match &result {
            Ok(turn) => {
                trace.outcome = match &turn.result.output {
                    ParsedOutput::ToolCalls { .. } => "tool_calls",
                    ParsedOutput::FinalText { .. } => "final_text",
                    ParsedOutput::PlainText { .. } => "plain_text",
                };
                trace.tool_call_count = turn.result.tool_calls().len();
                trace.thinking_source = turn.result.thinking_source();
                trace.usage = turn.usage;
                if let Some(usage) = &turn.usage {
                    run.usage.accumulate(usage);
                }
                run.trace.record_ai_call(trace);
            }
            Err(EngineError::ModelCall(e)) => {
                error!(error = %e, kind = e.error_kind(), "model call failed");
                trace.error = Some(e.to_string());
                run.trace.record_ai_call(trace);
            }
            Err(_) => {}
        }
        result
    }

    async fn call_buffered(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ModelTurn, EngineError> {
        let timeout = self.config.model_timeout;
        let completion = tokio::time::timeout(timeout, self.provider.complete(messages, options))
            .await
            .map_err(|_| ModelCallError::Timeout(timeout))??;

        Ok(ModelTurn {
            result: parse_response(&completion.content, completion.reasoning.as_deref()),
            usage: completion.usage,
            streamed_text: false,
        })
    }

    async fn call_streaming(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        sink: &EventSink,
        forward_thinking: bool,
    ) -> Result<ModelTurn, EngineError> {
        let timeout = self.config.model_timeout;
        let started = tokio::time::Instant::now();

        let bytes = tokio::select! {
            biased;
            _ = sink.closed() => return Err(EngineError::Cancelled),
            opened = tokio::time::timeout(timeout, self.provider.stream(messages, options)) => {
                opened.map_err(|_| ModelCallError::Timeout(timeout))??
            }
        };
        let mut decoded = DecodedStream::new(bytes, timeout.saturating_sub(started.elapsed()));
        let mut streamed_text = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => return Err(EngineError::Cancelled),
                next = decoded.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ModelCallError::StreamInterrupted(
                        "stream ended before completion".into(),
                    )
                    .into())
                }
            };

            match event {
                DecodedEvent::Reasoning { delta } | DecodedEvent::ThinkContent { delta } => {
                    if forward_thinking && !delta.is_empty() {
                        sink.send(StreamEvent::Thought { content: delta }).await?;
                    }
                }
                DecodedEvent::Content { delta } => {
                    if !delta.is_empty() {
                        streamed_text = true;
                        sink.send(StreamEvent::TextChunk { content: delta }).await?;
                    }
                }
                DecodedEvent::ThinkStart | DecodedEvent::ThinkEnd => {}
                DecodedEvent::ToolCall { calls } => {
                    debug!(tool_calls = calls.len(), "tool calls decoded");
                }
                DecodedEvent::Done { result, usage } => {
                    return Ok(ModelTurn {
                        result,
                        usage,
                        streamed_text,
                    });
                }
            }
        }
    }

    /// Append the exchange to the conversation, creating one when needed.
    /// Failures are logged and never change the answer.
    async fn persist(
        &self,
        run: &Run,
        answer: &str,
        trace: Option<serde_json::Value>,
    ) -> Option<ConversationId> {
        let conversation_id = match &run.conversation {
            Some(conversation) => conversation.id.clone(),
            None if run.assets_mode => return None,
            None => {
                let title = conversation_title(&user_content(&run.request));
                match self.store.create_conversation(&run.ctx.user_id, &title).await {
                    Ok(conversation) => {
                        Span::current().record("conversation_id", tracing::field::display(&conversation.id));
                        conversation.id
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to create conversation");
                        return None;
                    }
                }
            }
        };

        let base_metadata = MessageMetadata {
            request_id: Some(run.ctx.request_id.clone()),
            trace_enabled: run.request.trace,
            usage: None,
            trace: None,
        };

        let user = NewMessage {
            metadata: base_metadata.clone(),
            ..NewMessage::new(conversation_id.clone(), Role::User, user_content(&run.request))
        };
        if let Err(e) = self.store.append_message(user).await {
            warn!(error = %e, "failed to persist user message");
        }

        let assistant = NewMessage {
            thinking_content: (!run.thinking.is_empty()).then(|| run.thinking.join("\n\n")),
            tool_calls: (!run.summaries.is_empty()).then(|| run.summaries.clone()),
            metadata: MessageMetadata {
                usage: Some(run.usage),
                trace,
                ..base_metadata
            },
            ..NewMessage::new(conversation_id.clone(), Role::Assistant, answer)
        };
        if let Err(e) = self.store.append_message(assistant).await {
            warn!(error = %e, "failed to persist assistant message");
        }

        Some(conversation_id)
    }

    async fn finish(
        &self,
        mut run: Run,
        result: Result<RunOutcome, EngineError>,
    ) -> Result<RunOutcome, EngineError> {
        match &result {
            Ok(_) => run.transition(RunState::Done),
            Err(e) => {
                run.transition(RunState::Failed);
                run.trace.finalize();
                match e {
                    EngineError::Cancelled => info!(model_calls = run.call_index, "run cancelled by consumer"),
                    other => error!(error = %other, kind = other.error_kind(), "run failed"),
                }
                if let Some(conversation) = &run.conversation {
                    if let Err(e) = self.store.touch(&conversation.id).await {
                        warn!(error = %e, "failed to touch conversation");
                    }
                }
            }
        }
        result
    }
}

fn run_span(ctx: &RequestContext, streaming: bool) -> Span {
    info_span!(
        "prompt",
        request_id = %ctx.request_id,
        user_id = %ctx.user_id,
        conversation_id = tracing::field::Empty,
        streaming,
    )
}

/// Text stored as the user's turn.
fn user_content(request: &PromptRequest) -> String {
    let prompt = request.prompt_text();
    if request.content.is_empty() {
        return prompt.to_string();
    }
    let labels: Vec<&str> = request.content.iter().map(|a| a.label()).collect();
    let attached = format!("[Attached: {}]", labels.join(", "));
    if prompt.is_empty() {
        attached
    } else {
        format!("{prompt}\n\n{attached}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use recall_core::context::Capabilities;
    use recall_core::events::ToolCallStatus;
    use recall_core::ids::UserId;
    use recall_core::provider::Completion;
    use recall_core::tools::{Tool, ToolArgs, ToolError};
    use recall_llm::{MockProvider, MockResponse};
    use recall_store::{Database, SqliteConversationStore};

    use crate::error::ValidationError;
    use crate::registry::ToolRegistry;
    use crate::request::AssetRef;

    struct SearchNotes;

    #[async_trait]
    impl Tool for SearchNotes {
        fn name(&self) -> &str {
            "search_notes"
        }
        fn description(&self) -> &str {
            "Search the user's notes"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"query": {"type": "string"}}})
        }
        async fn execute(&self, args: ToolArgs, ctx: &RequestContext) -> Result<Value, ToolError> {
            let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
            Ok(json!([{"title": format!("note about {query}"), "owner": ctx.user_id.as_str()}]))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "create_task"
        }
        fn description(&self) -> &str {
            "Create a task"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: ToolArgs, _ctx: &RequestContext) -> Result<Value, ToolError> {
            Err(ToolError::ExecutionFailed("task service unavailable".into()))
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        provider: Arc<MockProvider>,
        store: Arc<SqliteConversationStore>,
    }

    fn harness(responses: Vec<MockResponse>) -> Harness {
        harness_with(responses, EngineConfig::default())
    }

    fn harness_with(responses: Vec<MockResponse>, config: EngineConfig) -> Harness {
        let provider = Arc::new(MockProvider::new(responses));
        let store = Arc::new(SqliteConversationStore::new(Database::in_memory().unwrap()));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SearchNotes));
        registry.register(Arc::new(BrokenTool));
        let orchestrator = Arc::new(Orchestrator::new(
            provider.clone(),
            Arc::new(registry),
            store.clone(),
            config,
        ));
        Harness {
            orchestrator,
            provider,
            store,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(UserId::new("user-1"))
    }

    fn search_call(query: &str) -> MockResponse {
        MockResponse::tool_calls(json!([{"name": "search_notes", "args": {"query": query}}]))
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn plain_answer_creates_conversation() {
        let h = harness(vec![MockResponse::text("It's sunny and 22°C.")]);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("What's the weather?"), ctx())
            .await
            .unwrap();

        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(response.response, "It's sunny and 22°C.");
        assert!(response.tool_calls.is_none());

        let conversation_id = response.conversation_id.expect("conversation created");
        let snapshot = h
            .store
            .load_conversation(&conversation_id, &UserId::new("user-1"), 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.conversation.title, "What's the weather?");
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[0].role, Role::User);
        assert_eq!(snapshot.history[1].content, "It's sunny and 22°C.");
        assert_eq!(
            snapshot.history[1].metadata.request_id.as_ref(),
            Some(&response.request_id)
        );
    }

    #[tokio::test]
    async fn unknown_conversation_fails_before_model_call() {
        let h = harness(vec![MockResponse::text("unused")]);
        let request = PromptRequest {
            conversation_id: Some(ConversationId::new().to_string()),
            ..PromptRequest::from_prompt("hello")
        };
        let err = h.orchestrator.run(request, ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::ConversationNotFound(_)));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn other_users_conversation_is_not_found() {
        let h = harness(vec![MockResponse::text("unused")]);
        let owned = h
            .store
            .create_conversation(&UserId::new("someone-else"), "private")
            .await
            .unwrap();
        let request = PromptRequest {
            conversation_id: Some(owned.id.to_string()),
            ..PromptRequest::from_prompt("hello")
        };
        let err = h.orchestrator.run(request, ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::ConversationNotFound(id) if id == owned.id));
    }

    #[tokio::test]
    async fn other_users_conversation_does_not_wait_for_its_lease() {
        let h = harness(vec![MockResponse::text("unused")]);
        let owned = h
            .store
            .create_conversation(&UserId::new("someone-else"), "private")
            .await
            .unwrap();
        let _held = h.orchestrator.locks.acquire(&owned.id).await;

        let request = PromptRequest {
            conversation_id: Some(owned.id.to_string()),
            ..PromptRequest::from_prompt("hello")
        };
        let err = tokio::time::timeout(Duration::from_secs(1), h.orchestrator.run(request, ctx()))
            .await
            .expect("rejected without queueing")
            .unwrap_err();
        assert!(matches!(err, EngineError::ConversationNotFound(_)));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn oversized_content_is_rejected_before_model_call() {
        let h = harness(vec![MockResponse::text("unused")]);
        let request = PromptRequest {
            content: vec![AssetRef::inline("document", "big", "x".repeat(11 * 1024 * 1024))],
            ..Default::default()
        };
        let err = h.orchestrator.run(request, ctx()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::ContentTooLarge { .. })
        ));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let h = harness(vec![
            search_call("rust"),
            MockResponse::text("You have one note about rust."),
        ]);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("What did I write about rust?"), ctx())
            .await
            .unwrap();

        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(response.response, "You have one note about rust.");
        let summaries = response.tool_calls.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].function_name, "search_notes");
        assert!(summaries[0].success);
        assert_eq!(summaries[0].result_summary, "Found 1 items");
        assert_eq!(summaries[0].arguments["query"], "rust");

        let second = &h.provider.requests()[1];
        let results = second.last().unwrap();
        assert_eq!(results.role, Role::User);
        let fed_back: Value = serde_json::from_str(&results.content).unwrap();
        assert_eq!(fed_back[0]["tool_name"], "search_notes");
        assert_eq!(fed_back[0]["result"][0]["owner"], "user-1");

        let assistant_turn = &second[second.len() - 2];
        assert_eq!(assistant_turn.role, Role::Assistant);
        assert!(assistant_turn.content.contains(r#""type":"tool_calls""#));
    }

    #[tokio::test]
    async fn tool_failure_is_fed_back_and_guidance_added_once() {
        let failing = || MockResponse::tool_calls(json!([{"name": "create_task", "args": {"title": "x"}}]));
        let h = harness(vec![failing(), failing(), MockResponse::text("I couldn't create the task.")]);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("Remind me to call mom"), ctx())
            .await
            .unwrap();

        assert_eq!(h.provider.call_count(), 3);
        assert_eq!(response.response, "I couldn't create the task.");
        let summaries = response.tool_calls.unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| !s.success));

        let second = &h.provider.requests()[1];
        let fed_back: Value = serde_json::from_str(&second[second.len() - 2].content).unwrap();
        assert_eq!(fed_back[0]["result"], Value::Null);
        assert!(fed_back[0]["error"].as_str().unwrap().contains("task service unavailable"));

        let third = &h.provider.requests()[2];
        let guidance = third
            .iter()
            .filter(|m| m.role == Role::System && m.content == TOOL_ERROR_GUIDANCE)
            .count();
        assert_eq!(guidance, 1);
    }

    #[tokio::test]
    async fn model_call_bound_is_never_exceeded() {
        let responses = (0..15).map(|i| search_call(&format!("q{i}"))).collect();
        let h = harness(responses);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("loop forever"), ctx())
            .await
            .unwrap();

        assert_eq!(h.provider.call_count(), 10);
        assert_eq!(response.tool_calls.unwrap().len(), 9);
        assert_eq!(response.response, FALLBACK_ANSWER);

        let requests = h.provider.requests();
        let closing = requests.last().unwrap();
        assert!(closing.iter().any(|m| m.content == FINAL_ANSWER_NOTE));
        assert!(!requests[8].iter().any(|m| m.content == FINAL_ANSWER_NOTE));
    }

    #[tokio::test]
    async fn configured_call_bound_cannot_exceed_ten() {
        let config = EngineConfig {
            max_model_calls: 25,
            ..Default::default()
        };
        let responses = (0..30).map(|i| search_call(&format!("q{i}"))).collect();
        let h = harness_with(responses, config);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("keep searching"), ctx())
            .await
            .unwrap();

        assert_eq!(h.provider.call_count(), 10);
        assert_eq!(response.response, FALLBACK_ANSWER);
    }

    #[tokio::test]
    async fn closing_call_answers_after_trailing_tool_calls() {
        let config = EngineConfig {
            max_model_calls: 3,
            ..Default::default()
        };
        let h = harness_with(
            vec![search_call("a"), search_call("b"), MockResponse::text("Final summary.")],
            config,
        );
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("research"), ctx())
            .await
            .unwrap();
        assert_eq!(h.provider.call_count(), 3);
        assert_eq!(response.tool_calls.unwrap().len(), 2);
        assert_eq!(response.response, "Final summary.");
    }

    #[tokio::test]
    async fn closing_call_falls_back_to_last_prose() {
        let config = EngineConfig {
            max_model_calls: 2,
            ..Default::default()
        };
        let with_prose = MockResponse::text(
            "Let me look that up.\n{\"type\":\"tool_calls\",\"calls\":[{\"name\":\"search_notes\",\"args\":{}}]}",
        );
        let h = harness_with(vec![with_prose, search_call("again")], config);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("find it"), ctx())
            .await
            .unwrap();
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(response.response, "Let me look that up.");
    }

    #[tokio::test]
    async fn assets_mode_makes_one_call_without_tools() {
        let h = harness(vec![MockResponse::text("<think>skim</think>The note lists milk and eggs.")]);
        let request = PromptRequest {
            prompt: Some("Summarize".into()),
            content: vec![AssetRef::inline("note", "Groceries", "milk, eggs")],
            ..Default::default()
        };
        let response = h.orchestrator.run(request, ctx()).await.unwrap();

        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(response.response, "The note lists milk and eggs.");
        assert_eq!(response.thinking_content.as_deref(), Some("skim"));
        assert!(response.conversation_id.is_none());

        let system = &h.provider.requests()[0][0];
        assert!(system.content.contains("milk, eggs"));
        assert!(!system.content.contains("search_notes"));
    }

    #[tokio::test]
    async fn background_task_assets_keep_tools() {
        let h = harness(vec![search_call("milk")]);
        let request = PromptRequest {
            prompt: Some("File this".into()),
            content: vec![AssetRef::inline("note", "Groceries", "milk")],
            context: crate::request::PromptContext {
                assets: Vec::new(),
                background_task_execution: true,
            },
            ..Default::default()
        };
        let response = h.orchestrator.run(request, ctx()).await.unwrap();
        assert_eq!(h.provider.call_count(), 1);
        assert!(h.provider.requests()[0][0].content.contains("search_notes"));
        assert!(response.response.contains("tool_calls"));
    }

    #[tokio::test]
    async fn unresolvable_assets_do_not_switch_mode() {
        let h = harness(vec![MockResponse::text("ok")]);
        let request = PromptRequest {
            prompt: Some("Look at this".into()),
            context: crate::request::PromptContext {
                assets: vec![AssetRef {
                    kind: "photo".into(),
                    id: Some("p1".into()),
                    ..Default::default()
                }],
                background_task_execution: false,
            },
            ..Default::default()
        };
        let response = h.orchestrator.run(request, ctx()).await.unwrap();
        assert!(response.conversation_id.is_some());
        let system = &h.provider.requests()[0][0];
        assert!(system.content.contains("[photo \"p1\": content unavailable]"));
        assert!(system.content.contains("search_notes"));
    }

    #[tokio::test]
    async fn history_is_loaded_and_extended() {
        let h = harness(vec![MockResponse::text("first"), MockResponse::text("second")]);
        let first = h
            .orchestrator
            .run(PromptRequest::from_prompt("one"), ctx())
            .await
            .unwrap();
        let id = first.conversation_id.unwrap();

        let second = h
            .orchestrator
            .run(
                PromptRequest {
                    conversation_id: Some(id.to_string()),
                    ..PromptRequest::from_prompt("two")
                },
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(second.conversation_id.as_ref(), Some(&id));

        let prompt = &h.provider.requests()[1];
        let contents: Vec<&str> = prompt[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "first", "two"]);

        let snapshot = h
            .store
            .load_conversation(&id, &UserId::new("user-1"), 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.conversation.message_count, 4);
    }

    #[tokio::test]
    async fn history_limit_caps_prompt() {
        let config = EngineConfig {
            history_limit: 2,
            ..Default::default()
        };
        let h = harness_with(
            vec![MockResponse::text("a1"), MockResponse::text("a2"), MockResponse::text("a3")],
            config,
        );
        let id = h
            .orchestrator
            .run(PromptRequest::from_prompt("q1"), ctx())
            .await
            .unwrap()
            .conversation_id
            .unwrap();
        for q in ["q2", "q3"] {
            h.orchestrator
                .run(
                    PromptRequest {
                        conversation_id: Some(id.to_string()),
                        ..PromptRequest::from_prompt(q)
                    },
                    ctx(),
                )
                .await
                .unwrap();
        }
        let last = h.provider.requests().pop().unwrap();
        let contents: Vec<&str> = last[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["q2", "a2", "q3"]);
    }

    #[tokio::test]
    async fn model_failure_is_generic_and_not_persisted() {
        let h = harness(vec![MockResponse::Error(ModelCallError::ServerError {
            status: 500,
            body: "upstream stack trace".into(),
        })]);
        let err = h
            .orchestrator
            .run(PromptRequest::from_prompt("hi"), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelCall(_)));
        assert_eq!(err.user_message(), recall_core::errors::GENERIC_AI_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn model_timeout_is_a_model_error() {
        let config = EngineConfig {
            model_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let h = harness_with(
            vec![MockResponse::delayed(Duration::from_secs(60), MockResponse::text("late"))],
            config,
        );
        let err = h
            .orchestrator
            .run(PromptRequest::from_prompt("hi"), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelCall(ModelCallError::Timeout(_))));
    }

    #[tokio::test]
    async fn trace_and_thinking_are_returned_when_requested() {
        let h = harness(vec![
            search_call("x"),
            MockResponse::text_with_reasoning("Done.", "weighing options"),
        ]);
        let request = PromptRequest {
            trace: true,
            enable_thinking: true,
            ..PromptRequest::from_prompt("go")
        };
        let response = h.orchestrator.run(request, ctx()).await.unwrap();

        let trace = response.trace.unwrap();
        assert_eq!(trace["requestId"], response.request_id.as_str());
        assert_eq!(trace["summary"]["aiCallCount"], 2);
        assert_eq!(trace["summary"]["toolCallCount"], 1);
        assert_eq!(trace["aiCalls"][0]["outcome"], "tool_calls");
        assert_eq!(trace["aiCalls"][1]["thinkingSource"], "reasoning-field");
        assert_eq!(response.thinking_content.as_deref(), Some("weighing options"));

        let snapshot = h
            .store
            .load_conversation(&response.conversation_id.unwrap(), &UserId::new("user-1"), 20)
            .await
            .unwrap()
            .unwrap();
        let assistant = &snapshot.history[1];
        assert!(assistant.metadata.trace_enabled);
        assert!(assistant.metadata.trace.is_some());
        assert_eq!(assistant.metadata.usage.unwrap().total_tokens, 30);
        assert_eq!(assistant.tool_calls.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_answer_uses_fallback() {
        let h = harness(vec![MockResponse::Reply(Completion::text("   "))]);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("hi"), ctx())
            .await
            .unwrap();
        assert_eq!(response.response, FALLBACK_ANSWER);
    }

    #[tokio::test]
    async fn json_answer_is_still_delivered() {
        let h = harness(vec![MockResponse::text(r#"{"temperature": 22}"#)]);
        let response = h
            .orchestrator
            .run(PromptRequest::from_prompt("weather as json"), ctx())
            .await
            .unwrap();
        assert_eq!(response.response, r#"{"temperature": 22}"#);
    }

    #[tokio::test]
    async fn same_conversation_runs_are_serialized() {
        let h = harness(vec![
            MockResponse::text("seed"),
            MockResponse::delayed(Duration::from_millis(50), MockResponse::text("first")),
            MockResponse::text("second"),
        ]);
        let id = h
            .orchestrator
            .run(PromptRequest::from_prompt("seed"), ctx())
            .await
            .unwrap()
            .conversation_id
            .unwrap();

        let request = |prompt: &str| PromptRequest {
            conversation_id: Some(id.to_string()),
            ..PromptRequest::from_prompt(prompt)
        };
        let (a, b) = tokio::join!(
            h.orchestrator.run(request("a"), ctx()),
            h.orchestrator.run(request("b"), ctx()),
        );
        assert_eq!(a.unwrap().response, "first");
        assert_eq!(b.unwrap().response, "second");

        // The second run saw the first run's exchange in its history.
        let second_prompt = &h.provider.requests()[2];
        let contents: Vec<&str> = second_prompt[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["seed", "seed", "a", "first", "b"]);
        assert_eq!(h.orchestrator.active_conversations(), 0);
    }

    #[tokio::test]
    async fn capabilities_flow_to_tools() {
        struct WhoAmI;

        #[async_trait]
        impl Tool for WhoAmI {
            fn name(&self) -> &str {
                "whoami"
            }
            fn description(&self) -> &str {
                "Report caller capabilities"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _args: ToolArgs, ctx: &RequestContext) -> Result<Value, ToolError> {
                Ok(json!({"assistant": ctx.capabilities.assistant_user}))
            }
        }

        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(json!([{"name": "whoami"}])),
            MockResponse::text("ok"),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WhoAmI));
        let orchestrator = Orchestrator::new(
            provider.clone(),
            Arc::new(registry),
            Arc::new(SqliteConversationStore::new(Database::in_memory().unwrap())),
            EngineConfig::default(),
        );
        let elevated = ctx().with_capabilities(Capabilities { assistant_user: true });
        orchestrator.run(PromptRequest::from_prompt("who"), elevated).await.unwrap();

        let fed_back: Value = serde_json::from_str(&provider.requests()[1].last().unwrap().content).unwrap();
        assert_eq!(fed_back[0]["result"]["assistant"], true);
    }

    #[tokio::test]
    async fn streaming_emits_chunks_then_done() {
        let h = harness(vec![MockResponse::text("Hello there, streaming world")]);
        let rx = h
            .orchestrator
            .run_streaming(PromptRequest::from_prompt("hi"), ctx())
            .await
            .unwrap();
        let events = collect(rx).await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextChunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello there, streaming world");
        assert!(events.iter().filter(|e| e.is_terminal()).count() == 1);
        match events.last().unwrap() {
            StreamEvent::Done { conversation_id, total_tokens, .. } => {
                assert!(conversation_id.is_some());
                assert_eq!(*total_tokens, 15);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_tool_calls_emit_status_sequence() {
        let h = harness(vec![search_call("rust"), MockResponse::text("Found it.")]);
        let rx = h
            .orchestrator
            .run_streaming(PromptRequest::from_prompt("find"), ctx())
            .await
            .unwrap();
        let events = collect(rx).await;

        let statuses: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            [ToolCallStatus::Starting, ToolCallStatus::Executing, ToolCallStatus::Completed]
        );

        // The envelope never leaks as text.
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::TextChunk { content } if content.contains("tool_calls")
        )));
        match events.last().unwrap() {
            StreamEvent::Done { tool_calls, .. } => assert_eq!(tool_calls.len(), 1),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_thoughts_only_when_enabled() {
        let reply = || MockResponse::text_with_reasoning("Answer.", "pondering");

        let h = harness(vec![reply()]);
        let events = collect(
            h.orchestrator
                .run_streaming(
                    PromptRequest {
                        enable_thinking: true,
                        ..PromptRequest::from_prompt("q")
                    },
                    ctx(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert!(events.contains(&StreamEvent::Thought { content: "pondering".into() }));

        let h = harness(vec![reply()]);
        let events = collect(
            h.orchestrator
                .run_streaming(PromptRequest::from_prompt("q"), ctx())
                .await
                .unwrap(),
        )
        .await;
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Thought { .. })));
    }

    #[tokio::test]
    async fn streaming_hides_reasoning_before_unopened_close_tag() {
        let h = harness(vec![MockResponse::text("secret reasoning</think>The answer")]);
        let events = collect(
            h.orchestrator
                .run_streaming(PromptRequest::from_prompt("q"), ctx())
                .await
                .unwrap(),
        )
        .await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextChunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "The answer");
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Thought { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn streaming_model_error_is_single_error_event() {
        let h = harness(vec![MockResponse::Error(ModelCallError::RateLimited)]);
        let events = collect(
            h.orchestrator
                .run_streaming(PromptRequest::from_prompt("hi"), ctx())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(
            events,
            [StreamEvent::Error {
                error: recall_core::errors::GENERIC_AI_ERROR.into()
            }]
        );
    }

    #[tokio::test]
    async fn streaming_truncated_body_is_an_error() {
        let h = harness(vec![MockResponse::Chunks(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n".into(),
            "data: {\"error\":{\"message\":\"overloaded\"}}\n\n".into(),
        ])]);
        let events = collect(
            h.orchestrator
                .run_streaming(PromptRequest::from_prompt("hi"), ctx())
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn streaming_fallback_answer_is_sent_as_text() {
        let h = harness(vec![MockResponse::Reply(Completion::text(""))]);
        let events = collect(
            h.orchestrator
                .run_streaming(PromptRequest::from_prompt("hi"), ctx())
                .await
                .unwrap(),
        )
        .await;
        assert!(events.contains(&StreamEvent::TextChunk { content: FALLBACK_ANSWER.into() }));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn streaming_validation_fails_before_stream() {
        let h = harness(vec![]);
        let err = h
            .orchestrator
            .run_streaming(PromptRequest::default(), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::EmptyRequest)));
    }

    #[tokio::test]
    async fn dropped_receiver_stops_stalled_run() {
        let h = harness(vec![MockResponse::text("seed"), MockResponse::Stall]);
        let id = h
            .orchestrator
            .run(PromptRequest::from_prompt("seed"), ctx())
            .await
            .unwrap()
            .conversation_id
            .unwrap();

        let rx = h
            .orchestrator
            .run_streaming(
                PromptRequest {
                    conversation_id: Some(id.to_string()),
                    ..PromptRequest::from_prompt("hang")
                },
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(h.orchestrator.active_conversations(), 1);
        drop(rx);

        for _ in 0..50 {
            if h.orchestrator.active_conversations() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.orchestrator.active_conversations(), 0);

        // Nothing was appended for the abandoned run.
        let snapshot = h
            .store
            .load_conversation(&id, &UserId::new("user-1"), 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.conversation.message_count, 2);
    }
}
