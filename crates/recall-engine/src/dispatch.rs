use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use recall_core::context::RequestContext;
use recall_core::events::{StreamEvent, ToolCallStatus};
use recall_core::ids::ToolCallId;
use recall_core::tools::{summarize_result, ToolCall, ToolCallSummary, ToolExecutionError, ToolExecutor};

use crate::error::EngineError;
use crate::prompt::tool_result_entry;
use crate::streaming::EventSink;
use crate::trace::{millis, ToolCallTrace};

/// Result of one executed tool call.
#[derive(Debug)]
pub struct ToolOutcome {
    pub call_id: ToolCallId,
    pub call: ToolCall,
    pub result: Result<Value, ToolExecutionError>,
    pub duration: Duration,
}

impl ToolOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn summary(&self) -> ToolCallSummary {
        let (success, error, result_summary) = match &self.result {
            Ok(value) => (true, None, summarize_result(value)),
            Err(e) => (false, Some(e.message.clone()), summarize_result(&Value::Null)),
        };
        ToolCallSummary {
            function_name: self.call.name.clone(),
            execution_time_ms: millis(self.duration),
            success,
            error,
            arguments: self.call.args.clone(),
            result_summary,
        }
    }

    /// Entry for the tool results turn.
    pub fn feedback(&self) -> Value {
        tool_result_entry(
            &self.call.name,
            self.result.as_ref().map_err(|e| e.message.as_str()),
        )
    }

    pub fn trace(&self, call_index: u32) -> ToolCallTrace {
        let summary = self.summary();
        ToolCallTrace {
            call_index,
            call_id: self.call_id.clone(),
            name: summary.function_name,
            arguments: summary.arguments,
            duration_ms: summary.execution_time_ms,
            success: summary.success,
            error: summary.error,
            result_summary: summary.result_summary,
        }
    }
}

/// Runs the tool calls of one iteration. Outcomes come back in call order
/// whatever the concurrency.
pub struct ToolDispatcher {
    executor: Arc<dyn ToolExecutor>,
    concurrency: usize,
}

impl ToolDispatcher {
    pub fn new(executor: Arc<dyn ToolExecutor>, concurrency: usize) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        ctx: &RequestContext,
        events: Option<&EventSink>,
    ) -> Result<Vec<ToolOutcome>, EngineError> {
        let runs = calls
            .iter()
            .cloned()
            .map(|call| run_one(Arc::clone(&self.executor), call, ctx.clone(), events.cloned()));

        if self.concurrency == 1 {
            let mut outcomes = Vec::with_capacity(calls.len());
            for run in runs {
                outcomes.push(run.await?);
            }
            Ok(outcomes)
        } else {
            futures::stream::iter(runs)
                .buffered(self.concurrency)
                .try_collect()
                .await
        }
    }
}

fn status_event(
    call_id: &ToolCallId,
    call: &ToolCall,
    status: ToolCallStatus,
    result: Option<&Result<Value, ToolExecutionError>>,
) -> StreamEvent {
    let (result, error) = match result {
        Some(Ok(value)) => (Some(value.clone()), None),
        Some(Err(e)) => (None, Some(e.message.clone())),
        None => (None, None),
    };
    StreamEvent::ToolCall {
        call_id: call_id.clone(),
        name: call.name.clone(),
        status,
        arguments: (status == ToolCallStatus::Starting).then(|| call.args.clone()),
        result,
        error,
    }
}

/// Each call runs on its own task, so a dropped run never aborts a tool
/// that already started.
#[instrument(skip_all, fields(tool = %call.name))]
async fn run_one(
    executor: Arc<dyn ToolExecutor>,
    call: ToolCall,
    ctx: RequestContext,
    events: Option<EventSink>,
) -> Result<ToolOutcome, EngineError> {
    let call_id = ToolCallId::new();
    if let Some(sink) = &events {
        sink.send(status_event(&call_id, &call, ToolCallStatus::Starting, None))
            .await?;
    }

    let started = Instant::now();
    let handle = {
        let name = call.name.clone();
        let args = call.args.clone();
        tokio::spawn(async move { executor.execute(&name, args, &ctx).await })
    };

    if let Some(sink) = &events {
        sink.send(status_event(&call_id, &call, ToolCallStatus::Executing, None))
            .await?;
    }

    let result = match handle.await {
        Ok(result) => result,
        Err(join_err) => {
            error!(error = %join_err, "tool task failed");
            Err(ToolExecutionError::new(&call.name, "tool task failed"))
        }
    };
    let duration = started.elapsed();

    match &result {
        Ok(_) => debug!(duration_ms = millis(duration), "tool completed"),
        Err(e) => warn!(duration_ms = millis(duration), error = %e.message, "tool failed"),
    }

    if let Some(sink) = &events {
        let status = if result.is_ok() {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Error
        };
        sink.send(status_event(&call_id, &call, status, Some(&result)))
            .await?;
    }

    Ok(ToolOutcome {
        call_id,
        call,
        result,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recall_core::ids::UserId;
    use recall_core::tools::{ToolArgs, ToolDefinition};
    use serde_json::json;
    use std::sync::Mutex;

    /// Order in which calls started and finished.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    /// `sleep_ms` arg delays the call; name `fail` errors.
    struct ScriptedExecutor {
        log: Recorder,
    }

    #[async_trait]
    impl ToolExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            name: &str,
            args: ToolArgs,
            _ctx: &RequestContext,
        ) -> Result<Value, ToolExecutionError> {
            let label = args.get("label").and_then(Value::as_str).unwrap_or(name).to_string();
            self.log.push(format!("start {label}"));
            if let Some(ms) = args.get("sleep_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            self.log.push(format!("end {label}"));
            if name == "fail" {
                return Err(ToolExecutionError::new(name, "db down"));
            }
            Ok(json!([label]))
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    fn call(name: &str, label: &str, sleep_ms: u64) -> ToolCall {
        let mut args = ToolArgs::new();
        args.insert("label".into(), json!(label));
        args.insert("sleep_ms".into(), json!(sleep_ms));
        ToolCall::new(name, args)
    }

    fn executor() -> Arc<ScriptedExecutor> {
        Arc::new(ScriptedExecutor { log: Recorder::default() })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(UserId::new("u1"))
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_runs_in_request_order() {
        let exec = executor();
        let dispatcher = ToolDispatcher::new(exec.clone(), 1);
        let outcomes = dispatcher
            .dispatch(&[call("search", "a", 50), call("search", "b", 10)], &ctx(), None)
            .await
            .unwrap();

        assert_eq!(exec.log.entries(), ["start a", "end a", "start b", "end b"]);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &json!(["a"]));
        assert_eq!(outcomes[1].result.as_ref().unwrap(), &json!(["b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_keeps_call_order_in_results() {
        let exec = executor();
        let dispatcher = ToolDispatcher::new(exec.clone(), 4);
        let outcomes = dispatcher
            .dispatch(&[call("search", "slow", 50), call("search", "fast", 10)], &ctx(), None)
            .await
            .unwrap();

        let log = exec.log.entries();
        let fast_end = log.iter().position(|e| e == "end fast").unwrap();
        let slow_end = log.iter().position(|e| e == "end slow").unwrap();
        assert!(fast_end < slow_end, "fast call should finish first: {log:?}");

        let labels: Vec<&Value> = outcomes.iter().map(|o| o.result.as_ref().unwrap()).collect();
        assert_eq!(labels, [&json!(["slow"]), &json!(["fast"])]);
    }

    #[tokio::test]
    async fn failures_become_outcomes() {
        let dispatcher = ToolDispatcher::new(executor(), 1);
        let outcomes = dispatcher
            .dispatch(&[call("fail", "x", 0), call("search", "y", 0)], &ctx(), None)
            .await
            .unwrap();

        assert!(!outcomes[0].succeeded());
        let summary = outcomes[0].summary();
        assert!(!summary.success);
        assert_eq!(summary.error.as_deref(), Some("db down"));
        assert_eq!(summary.result_summary, "Operation completed");
        assert_eq!(
            outcomes[0].feedback(),
            json!({"tool_name": "fail", "result": null, "error": "db down"})
        );

        assert!(outcomes[1].succeeded());
        assert_eq!(outcomes[1].summary().result_summary, "Found 1 items");
    }

    #[tokio::test]
    async fn emits_status_events_per_call() {
        let (sink, mut rx) = EventSink::channel();
        let dispatcher = ToolDispatcher::new(executor(), 1);
        dispatcher
            .dispatch(&[call("search", "a", 0), call("fail", "b", 0)], &ctx(), Some(&sink))
            .await
            .unwrap();
        drop(sink);

        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::ToolCall { name, status, arguments, .. } = event {
                assert_eq!(arguments.is_some(), status == ToolCallStatus::Starting);
                statuses.push((name, status));
            }
        }
        use ToolCallStatus::*;
        assert_eq!(
            statuses,
            [
                ("search".to_string(), Starting),
                ("search".to_string(), Executing),
                ("search".to_string(), Completed),
                ("fail".to_string(), Starting),
                ("fail".to_string(), Executing),
                ("fail".to_string(), Error),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_consumer_does_not_abort_started_tool() {
        let exec = executor();
        let (sink, mut rx) = EventSink::channel();
        let dispatcher = ToolDispatcher::new(exec.clone(), 1);

        let consumer = tokio::spawn(async move {
            // Take the `starting` event, then hang up.
            let first = rx.recv().await;
            drop(rx);
            first
        });

        let result = dispatcher
            .dispatch(&[call("search", "side-effect", 100)], &ctx(), Some(&sink))
            .await;
        assert!(consumer.await.unwrap().is_some());

        // The run may stop at `executing` or `completed`; either way the tool keeps going.
        if let Err(e) = result {
            assert!(matches!(e, EngineError::Cancelled));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(exec.log.entries().contains(&"end side-effect".to_string()));
    }

    #[test]
    fn trace_entry_mirrors_summary() {
        let outcome = ToolOutcome {
            call_id: ToolCallId::new(),
            call: call("search", "a", 0),
            result: Ok(json!({"a": 1})),
            duration: Duration::from_millis(12),
        };
        let trace = outcome.trace(2);
        assert_eq!(trace.call_index, 2);
        assert_eq!(trace.duration_ms, 12);
        assert_eq!(trace.result_summary, "Retrieved data with 1 fields");
    }
}
