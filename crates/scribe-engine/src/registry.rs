use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, warn};

use scribe_core::tools::{Tool, ToolDefinition, ToolError, ToolFailure};

use crate::approval::{ApprovalDecision, ApprovalGate, ToolCallRequest};

/// Filter for selecting the tools an agent may see.
#[derive(Clone, Debug, Default)]
pub enum ToolFilter {
    /// Every registered tool.
    InheritAll,
    /// Every tool except these.
    InheritExcept(HashSet<String>),
    /// Only these tools.
    Explicit(HashSet<String>),
    /// No tools at all.
    #[default]
    None,
}

impl ToolFilter {
    pub fn only(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Explicit(names.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::InheritAll => true,
            Self::InheritExcept(excluded) => !excluded.contains(name),
            Self::Explicit(included) => included.contains(name),
            Self::None => false,
        }
    }
}

/// Registry of named tools any agent may invoke.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "replaced an already registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// A copy holding only the tools `filter` allows.
    pub fn filtered(&self, filter: &ToolFilter) -> Self {
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| filter.allows(name))
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();
        Self { tools }
    }

    /// Run a tool by name.
    ///
    /// The approval gate is consulted first. Execution is bounded by `timeout`
    /// and a panicking tool is reported as a failure instead of unwinding into
    /// the caller.
    pub async fn invoke(
        &self,
        request: &ToolCallRequest,
        timeout: Duration,
        gate: &dyn ApprovalGate,
    ) -> Result<String, ToolError> {
        let name = request.name.as_str();
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let args = match gate.review(request).await {
            ApprovalDecision::Approve => request.arguments.clone(),
            ApprovalDecision::Edit(args) => {
                debug!(tool = %name, "tool arguments edited before execution");
                args
            }
            ApprovalDecision::Deny(reason) => {
                return Err(ToolError::execution(name, ToolFailure::Denied(reason)));
            }
        };

        let start = Instant::now();
        let result =
            tokio::time::timeout(timeout, AssertUnwindSafe(tool.execute(args)).catch_unwind())
                .await;
        let duration = start.elapsed();

        match result {
            Ok(Ok(Ok(output))) => {
                debug!(tool = %name, duration_ms = duration.as_millis() as u64, "tool finished");
                Ok(output)
            }
            Ok(Ok(Err(failure))) => {
                warn!(tool = %name, error = %failure, "tool failed");
                Err(ToolError::execution(name, failure))
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %name, panic = %msg, "tool panicked during execution");
                Err(ToolError::execution(name, ToolFailure::Panicked(msg)))
            }
            Err(_) => {
                warn!(tool = %name, timeout_secs = timeout.as_secs(), "tool timed out");
                Err(ToolError::execution(name, ToolFailure::TimedOut(timeout)))
            }
        }
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
