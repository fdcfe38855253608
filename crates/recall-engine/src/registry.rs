use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use recall_core::context::RequestContext;
use recall_core::tools::{Tool, ToolArgs, ToolDefinition, ToolExecutionError, ToolExecutor};

use crate::config::DEFAULT_TOOL_TIMEOUT;

/// Registry of available tools, callable by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(
        &self,
        name: &str,
        args: ToolArgs,
        ctx: &RequestContext,
    ) -> Result<Value, ToolExecutionError> {
        let Some(tool) = self.get(name) else {
            return Err(ToolExecutionError::new(name, "unknown tool"));
        };

        let result = tokio::time::timeout(
            self.timeout,
            std::panic::AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ToolExecutionError::new(name, e.to_string())),
            Ok(Err(panic)) => {
                error!(tool = name, panic = %panic_message(&panic), "tool panicked during execution");
                Err(ToolExecutionError::new(name, "internal error: tool crashed"))
            }
            Err(_) => {
                warn!(tool = name, timeout_secs = self.timeout.as_secs(), "tool timed out");
                Err(ToolExecutionError::new(
                    name,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ))
            }
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
