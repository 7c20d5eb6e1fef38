//! Worker agents: stateless reasoning units the supervisor delegates to.
//!
//! Each `run` starts from an empty transcript holding only the task text, so
//! nothing carries over between invocations except what the caller passes in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use scribe_core::context::LlmContext;
use scribe_core::errors::GatewayError;
use scribe_core::events::{AgentRole, ToolCallMeta, ToolCallPhase};
use scribe_core::ids::ToolCallId;
use scribe_core::messages::{Message, ToolCallBlock};
use scribe_core::provider::{LlmProvider, StreamOptions};
use scribe_core::report::StructuredReport;
use scribe_core::stream::StreamEvent;
use scribe_core::tools::ToolError;

use crate::approval::{ApprovalGate, AutoApprove, ToolCallRequest};
use crate::prompts;
use crate::registry::{ToolFilter, ToolRegistry};
use crate::sink::EventSink;
use crate::tools::word_counter;

/// What a worker hands back to the supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerOutput {
    Text(String),
    Report(StructuredReport),
}

impl WorkerOutput {
    /// The text the supervisor sees as the delegation result.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Report(report) => report.render(),
        }
    }
}

/// How a worker's final answer is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Report,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum WorkerFailure {
    #[error("provider error: {0}")]
    Provider(GatewayError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("no final answer within {0} reasoning steps")]
    StepLimit(u32),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{worker} invocation failed: {failure}")]
    Invocation {
        worker: AgentRole,
        failure: WorkerFailure,
    },

    #[error("{worker} returned malformed output: {reason}")]
    MalformedOutput {
        worker: AgentRole,
        raw: String,
        reason: String,
    },
}

impl WorkerError {
    pub fn invocation(worker: AgentRole, failure: WorkerFailure) -> Self {
        Self::Invocation { worker, failure }
    }

    pub fn worker(&self) -> AgentRole {
        match self {
            Self::Invocation { worker, .. } | Self::MalformedOutput { worker, .. } => *worker,
        }
    }

    /// Whether running the same task again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Invocation { failure, .. } => match failure {
                WorkerFailure::Provider(e) => e.is_retryable(),
                WorkerFailure::TimedOut(_) => true,
                WorkerFailure::StepLimit(_) | WorkerFailure::Cancelled => false,
            },
            Self::MalformedOutput { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Invocation {
                failure: WorkerFailure::TimedOut(_),
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Invocation {
                failure: WorkerFailure::Cancelled,
                ..
            }
        )
    }
}

/// Bounded retry for worker invocations that fail with a retryable error.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// The delegation call a worker is running under.
#[derive(Clone, Debug)]
pub struct CallOrigin {
    pub tool_call_id: ToolCallId,
    pub name: String,
}

/// Per-invocation limits and plumbing.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub timeout: Duration,
    pub tool_timeout: Duration,
    pub cancel: CancellationToken,
    pub sink: Option<EventSink>,
    pub origin: Option<CallOrigin>,
}

impl WorkerContext {
    pub fn new(timeout: Duration, tool_timeout: Duration) -> Self {
        Self {
            timeout,
            tool_timeout,
            cancel: CancellationToken::new(),
            sink: None,
            origin: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_origin(mut self, origin: CallOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Progress events are display-only; a closed sink is noticed through
    /// the cancellation token instead.
    async fn emit(&self, meta: ToolCallMeta) {
        if let Some(sink) = &self.sink {
            if sink.tool_call(meta).await.is_err() {
                debug!("event sink closed, dropping worker progress");
            }
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn run(&self, task: &str, ctx: &WorkerContext) -> Result<WorkerOutput, WorkerError>;
}

/// Declarative description of a worker.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub role: AgentRole,
    pub system_prompt: String,
    pub output: OutputMode,
    pub tool_filter: ToolFilter,
    /// A tool that must succeed at least once before a final answer is accepted.
    pub required_tool: Option<String>,
    pub max_steps: u32,
}

impl WorkerSpec {
    /// Drafts text; no tools.
    pub fn writer() -> Self {
        Self {
            role: AgentRole::Writer,
            system_prompt: prompts::WRITER_PROMPT.to_string(),
            output: OutputMode::Text,
            tool_filter: ToolFilter::None,
            required_tool: None,
            max_steps: 4,
        }
    }

    /// Measures with `word_counter`, then answers with a structured report.
    pub fn reviewer() -> Self {
        Self {
            role: AgentRole::Reviewer,
            system_prompt: prompts::reviewer_prompt(),
            output: OutputMode::Report,
            tool_filter: ToolFilter::only([word_counter::NAME]),
            required_tool: Some(word_counter::NAME.to_string()),
            max_steps: 6,
        }
    }
}

/// A worker backed by a reasoning model and a bounded tool loop.
pub struct LlmWorker {
    spec: WorkerSpec,
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    gate: Arc<dyn ApprovalGate>,
    options: StreamOptions,
}

impl LlmWorker {
    pub fn new(spec: WorkerSpec, provider: Arc<dyn LlmProvider>, registry: &ToolRegistry) -> Self {
        let tools = registry.filtered(&spec.tool_filter);
        Self {
            spec,
            provider,
            tools,
            gate: Arc::new(AutoApprove),
            options: StreamOptions::default(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    fn fail(&self, failure: WorkerFailure) -> WorkerError {
        WorkerError::invocation(self.spec.role, failure)
    }

    async fn run_loop(&self, task: &str, ctx: &WorkerContext) -> Result<WorkerOutput, WorkerError> {
        let definitions = self.tools.definitions();
        let mut messages = vec![Message::user(task)];
        let mut required_done = self.spec.required_tool.is_none();

        for step in 1..=self.spec.max_steps {
            let llm_ctx = LlmContext::new(self.spec.system_prompt.clone())
                .with_messages(messages.clone())
                .with_tools(definitions.clone());
            let reply = self.reason(&llm_ctx, ctx).await?;
            let calls = reply.tool_calls().to_vec();
            let text = reply.content().to_string();
            messages.push(reply);

            if calls.is_empty() {
                if !required_done {
                    let tool = self.spec.required_tool.as_deref().unwrap_or_default();
                    warn!(worker = %self.spec.role, step, tool, "final answer before required tool, reminding");
                    messages.push(Message::user(prompts::required_tool_reminder(tool)));
                    continue;
                }
                debug!(worker = %self.spec.role, step, "worker produced final answer");
                return self.finish(text);
            }

            let results = join_all(calls.iter().map(|call| self.call_tool(call, ctx))).await;
            for (call, result) in calls.iter().zip(results) {
                let content = match result {
                    Ok(output) => {
                        if self.spec.required_tool.as_deref() == Some(call.name.as_str()) {
                            required_done = true;
                        }
                        output
                    }
                    Err(e) => e.as_tool_result(),
                };
                messages.push(Message::tool_result(call.id.clone(), content));
            }
        }

        Err(self.fail(WorkerFailure::StepLimit(self.spec.max_steps)))
    }

    /// One streamed reasoning call. Text deltas are surfaced as progress on
    /// the delegation that started this worker.
    async fn reason(&self, llm_ctx: &LlmContext, ctx: &WorkerContext) -> Result<Message, WorkerError> {
        let mut stream = self
            .provider
            .stream(llm_ctx, &self.options)
            .await
            .map_err(|e| self.fail(WorkerFailure::Provider(e)))?;

        let mut reply = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta } => {
                    if let Some(origin) = &ctx.origin {
                        let meta = ToolCallMeta::new(
                            self.spec.role,
                            origin.tool_call_id.clone(),
                            origin.name.clone(),
                            ToolCallPhase::Progress,
                        )
                        .with_detail(delta);
                        ctx.emit(meta).await;
                    }
                }
                StreamEvent::Done { message, .. } => reply = Some(message),
                StreamEvent::Error { error } => {
                    return Err(self.fail(WorkerFailure::Provider(error)));
                }
                _ => {}
            }
        }

        reply.ok_or_else(|| {
            self.fail(WorkerFailure::Provider(GatewayError::StreamInterrupted(
                "stream ended without a final message".into(),
            )))
        })
    }

    async fn call_tool(&self, call: &ToolCallBlock, ctx: &WorkerContext) -> Result<String, ToolError> {
        let meta = |phase| ToolCallMeta::new(self.spec.role, call.id.clone(), call.name.clone(), phase);
        ctx.emit(meta(ToolCallPhase::Started)).await;

        let request = ToolCallRequest {
            agent: self.spec.role,
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        };
        let result = self
            .tools
            .invoke(&request, ctx.tool_timeout, self.gate.as_ref())
            .await;

        match &result {
            Ok(output) => ctx.emit(meta(ToolCallPhase::Completed).with_detail(output.clone())).await,
            Err(e) => {
                warn!(worker = %self.spec.role, tool = %call.name, error = %e, "worker tool call failed");
                ctx.emit(meta(ToolCallPhase::Failed).with_detail(e.to_string())).await;
            }
        }
        result
    }

    fn finish(&self, text: String) -> Result<WorkerOutput, WorkerError> {
        match self.spec.output {
            OutputMode::Text => Ok(WorkerOutput::Text(text)),
            OutputMode::Report => match StructuredReport::parse(&text) {
                Ok(report) => Ok(WorkerOutput::Report(report)),
                Err(e) => Err(WorkerError::MalformedOutput {
                    worker: self.spec.role,
                    raw: text,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

#[async_trait]
impl Worker for LlmWorker {
    fn role(&self) -> AgentRole {
        self.spec.role
    }

    #[instrument(skip_all, fields(worker = %self.spec.role))]
    async fn run(&self, task: &str, ctx: &WorkerContext) -> Result<WorkerOutput, WorkerError> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(self.fail(WorkerFailure::Cancelled)),
            result = tokio::time::timeout(ctx.timeout, self.run_loop(task, ctx)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(worker = %self.spec.role, timeout_secs = ctx.timeout.as_secs(), "worker timed out");
                    Err(self.fail(WorkerFailure::TimedOut(ctx.timeout)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::create_default_registry;
    use scribe_core::events::TurnEvent;
    use scribe_llm::{MockProvider, MockResponse};

    const REPORT: &str =
        r#"{"word_count": 13, "score": 85, "comments": ["Tighten the ending."], "is_passed": true}"#;

    fn context() -> WorkerContext {
        WorkerContext::new(Duration::from_secs(30), Duration::from_secs(5))
    }

    fn reviewer(mock: &Arc<MockProvider>) -> LlmWorker {
        LlmWorker::new(WorkerSpec::reviewer(), mock.clone(), &create_default_registry())
    }

    fn writer(mock: &Arc<MockProvider>) -> LlmWorker {
        LlmWorker::new(WorkerSpec::writer(), mock.clone(), &create_default_registry())
    }

    #[tokio::test]
    async fn writer_returns_text_and_reports_progress() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text_chunks(&[
            "Python is ",
            "fun.",
        ])]));
        let (sink, mut rx) = EventSink::channel(16);
        let ctx = context().with_sink(sink).with_origin(CallOrigin {
            tool_call_id: ToolCallId::from_raw("call_d1"),
            name: "delegate_to_writer".into(),
        });

        let out = writer(&mock).run("Write about Python", &ctx).await.unwrap();
        assert_eq!(out, WorkerOutput::Text("Python is fun.".into()));

        drop(ctx);
        let mut details = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::ToolCallDelta(meta) => {
                    assert_eq!(meta.agent, AgentRole::Writer);
                    assert_eq!(meta.phase, ToolCallPhase::Progress);
                    assert_eq!(meta.tool_call_id.as_str(), "call_d1");
                    details.push(meta.detail.unwrap());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(details.concat(), "Python is fun.");

        let ctxs = mock.contexts();
        assert!(ctxs[0].tools.is_empty());
        assert_eq!(ctxs[0].messages, vec![Message::user("Write about Python")]);
    }

    #[tokio::test]
    async fn reviewer_counts_then_reports() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("word_counter", json!({"text": "Python is fun"})),
            MockResponse::text(REPORT),
        ]));

        let out = reviewer(&mock).run("Python is fun", &context()).await.unwrap();
        match out {
            WorkerOutput::Report(report) => {
                assert_eq!(report.word_count, 13);
                assert!(report.is_passed);
            }
            other => panic!("expected report, got {other:?}"),
        }

        let ctxs = mock.contexts();
        assert_eq!(ctxs[0].tools.len(), 1);
        assert_eq!(ctxs[0].tools[0].name, "word_counter");
        let tool_result = ctxs[1].messages.last().unwrap();
        assert_eq!(tool_result.content(), "Current text length: 13 characters.");
    }

    #[tokio::test]
    async fn reviewer_is_reminded_to_count_first() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::text(REPORT),
            MockResponse::tool_call("word_counter", json!({"text": "abc"})),
            MockResponse::text(REPORT),
        ]));

        let out = reviewer(&mock).run("abc", &context()).await.unwrap();
        assert!(matches!(out, WorkerOutput::Report(_)));
        assert_eq!(mock.call_count(), 3);
        let reminder = mock.contexts()[1].last_user_text().unwrap().to_string();
        assert!(reminder.contains("word_counter"), "{reminder}");
    }

    #[tokio::test]
    async fn malformed_report_keeps_raw_text() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("word_counter", json!({"text": "abc"})),
            MockResponse::text("Looks great, 3 characters, I'd give it 90."),
        ]));

        let err = reviewer(&mock).run("abc", &context()).await.unwrap_err();
        match err {
            WorkerError::MalformedOutput { worker, raw, .. } => {
                assert_eq!(worker, AgentRole::Reviewer);
                assert_eq!(raw, "Looks great, 3 characters, I'd give it 90.");
            }
            other => panic!("expected malformed output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_does_not_abort_siblings() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![
                ("spell_checker", json!({"text": "abc"})),
                ("word_counter", json!({"text": "abc"})),
            ]),
            MockResponse::text(REPORT),
        ]));

        let out = reviewer(&mock).run("abc", &context()).await.unwrap();
        assert!(matches!(out, WorkerOutput::Report(_)));

        let results: Vec<String> = mock.contexts()[1]
            .messages
            .iter()
            .filter(|m| m.tool_call_id().is_some())
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(
            results,
            [
                "[error] unknown tool: spell_checker",
                "Current text length: 3 characters."
            ]
        );
    }

    #[tokio::test]
    async fn step_limit() {
        let mock = Arc::new(MockProvider::with_responder(|_| {
            MockResponse::tool_call("word_counter", json!({"text": "again"}))
        }));
        let err = reviewer(&mock).run("abc", &context()).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Invocation {
                failure: WorkerFailure::StepLimit(6),
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert_eq!(mock.call_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinguishable() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(60),
            MockResponse::text("too late"),
        )]));
        let ctx = WorkerContext::new(Duration::from_secs(2), Duration::from_secs(1));
        let err = writer(&mock).run("task", &ctx).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn provider_errors_surface_as_invocation_errors() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::stream_error(
            GatewayError::ProviderOverloaded,
        )]));
        let err = writer(&mock).run("task", &context()).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Invocation {
                worker: AgentRole::Writer,
                failure: WorkerFailure::Provider(GatewayError::ProviderOverloaded),
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text("hi")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = context().with_cancel(cancel);
        let err = writer(&mock).run("task", &ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn retry_delays_double() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn report_output_renders_for_supervisor() {
        let report = StructuredReport::parse(REPORT).unwrap();
        let text = WorkerOutput::Report(report).into_text();
        assert!(text.starts_with("[Review Report]"));
        assert!(text.contains("Word count: 13"));
    }
}
