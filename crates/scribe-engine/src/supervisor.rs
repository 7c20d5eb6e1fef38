//! The supervisor's turn state machine.
//!
//! `Idle → Planning → Delegating(worker) → … → Synthesizing → Done`, with
//! `Failed` reachable from any non-terminal phase. Every step that changes the
//! transcript is committed together with a checkpoint, so an interrupted turn
//! can be resumed from the last committed step without repeating delegations.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use scribe_core::context::LlmContext;
use scribe_core::errors::GatewayError;
use scribe_core::events::{AgentRole, ToolCallMeta, ToolCallPhase};
use scribe_core::ids::{ThreadId, TurnId};
use scribe_core::messages::{Message, ToolCallBlock};
use scribe_core::provider::{LlmProvider, StreamOptions};
use scribe_core::stream::StreamEvent;
use scribe_core::tools::{ToolDefinition, ToolError};
use scribe_store::ConversationStore;

use crate::approval::{ApprovalGate, AutoApprove, ToolCallRequest};
use crate::checkpoint::{TurnCheckpoint, TurnPhase};
use crate::delegation::{delegation_definitions, Delegation, Team};
use crate::error::EngineError;
use crate::prompts::SUPERVISOR_PROMPT;
use crate::registry::{ToolFilter, ToolRegistry};
use crate::sink::EventSink;
use crate::worker::{CallOrigin, RetryPolicy, WorkerContext, WorkerError, WorkerFailure, WorkerOutput};

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Delegations allowed per turn before the plan is stopped.
    pub max_delegation_steps: u32,
    pub worker_timeout: Duration,
    pub tool_timeout: Duration,
    pub worker_retry: RetryPolicy,
    pub stream_options: StreamOptions,
    /// Registry tools the supervisor may call directly, besides delegating.
    pub direct_tools: ToolFilter,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_delegation_steps: 8,
            worker_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
            worker_retry: RetryPolicy::default(),
            stream_options: StreamOptions::default(),
            direct_tools: ToolFilter::None,
        }
    }
}

/// Per-turn plumbing supplied by the driver.
#[derive(Clone, Debug)]
pub struct TurnContext {
    pub sink: EventSink,
    pub cancel: CancellationToken,
    pub worker_timeout: Duration,
    pub tool_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    /// The final assistant message content, equal to every content delta of the turn in order.
    pub reply: String,
    pub steps: u32,
    pub message_count: u64,
}

/// A turn in progress: its checkpoint and the sequence its next commit takes.
struct TurnRun {
    thread_id: ThreadId,
    checkpoint: TurnCheckpoint,
    next_sequence: u64,
}

pub struct Supervisor {
    provider: Arc<dyn LlmProvider>,
    team: Team,
    tools: ToolRegistry,
    gate: Arc<dyn ApprovalGate>,
    store: Arc<dyn ConversationStore>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        team: Team,
        registry: &ToolRegistry,
        store: Arc<dyn ConversationStore>,
        config: SupervisorConfig,
    ) -> Self {
        let tools = registry.filtered(&config.direct_tools);
        Self {
            provider,
            team,
            tools,
            gate: Arc::new(AutoApprove),
            store,
            config,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Start a new turn: commit the user's query and plan from there.
    #[instrument(skip(self, query, ctx), fields(thread_id = %thread_id))]
    pub async fn run_turn(
        &self,
        thread_id: &ThreadId,
        query: &str,
        ctx: &TurnContext,
    ) -> Result<TurnOutcome, EngineError> {
        let latest = self.store.latest_checkpoint(thread_id)?;
        let mut run = TurnRun {
            thread_id: thread_id.clone(),
            checkpoint: TurnCheckpoint::fresh(query),
            next_sequence: latest.map_or(1, |c| c.sequence + 1),
        };
        info!(turn_id = %run.checkpoint.turn_id, "turn started");

        run.checkpoint.transition(TurnPhase::Planning);
        self.commit(&mut run, &[Message::user(query)])?;
        self.drive(&mut run, ctx).await
    }

    /// Continue the thread's interrupted turn from its latest checkpoint.
    ///
    /// Text already streamed before the interruption is replayed first, so the
    /// resumed stream's deltas still add up to the final message.
    #[instrument(skip(self, ctx), fields(thread_id = %thread_id))]
    pub async fn resume_turn(
        &self,
        thread_id: &ThreadId,
        ctx: &TurnContext,
    ) -> Result<TurnOutcome, EngineError> {
        let (checkpoint, sequence) = self
            .in_flight(thread_id)?
            .ok_or_else(|| EngineError::NothingToResume(thread_id.clone()))?;
        info!(
            turn_id = %checkpoint.turn_id,
            step = checkpoint.step,
            pending = checkpoint.pending.len(),
            "resuming turn"
        );

        ctx.sink.content(&checkpoint.reply).await?;
        let mut run = TurnRun {
            thread_id: thread_id.clone(),
            checkpoint,
            next_sequence: sequence + 1,
        };
        self.drive(&mut run, ctx).await
    }

    /// The thread's latest checkpoint and its sequence, if that turn never finished.
    pub fn in_flight(&self, thread_id: &ThreadId) -> Result<Option<(TurnCheckpoint, u64)>, EngineError> {
        let Some(stored) = self.store.latest_checkpoint(thread_id)? else {
            return Ok(None);
        };
        let checkpoint = TurnCheckpoint::from_checkpoint(&stored)?;
        Ok(checkpoint.is_in_flight().then_some((checkpoint, stored.sequence)))
    }

    /// Mark the thread's interrupted turn as failed so it is no longer resumable.
    ///
    /// Tool calls the turn left unanswered get an error result in the same
    /// commit, so the transcript stays a valid conversation for later turns.
    pub fn abandon(&self, thread_id: &ThreadId, reason: &str) -> Result<Option<TurnId>, EngineError> {
        let Some((checkpoint, sequence)) = self.in_flight(thread_id)? else {
            return Ok(None);
        };
        let mut run = TurnRun {
            thread_id: thread_id.clone(),
            checkpoint,
            next_sequence: sequence + 1,
        };
        let closing: Vec<Message> = run
            .checkpoint
            .pending
            .iter()
            .map(|call| Message::tool_result(call.id.clone(), format!("[error] turn failed: {reason}")))
            .collect();
        run.checkpoint.fail(reason);
        self.commit(&mut run, &closing)?;
        warn!(thread_id = %thread_id, turn_id = %run.checkpoint.turn_id, reason, "turn abandoned");
        Ok(Some(run.checkpoint.turn_id))
    }

    async fn drive(&self, run: &mut TurnRun, ctx: &TurnContext) -> Result<TurnOutcome, EngineError> {
        let mut tools = delegation_definitions();
        tools.extend(self.tools.definitions());

        loop {
            while let Some(call) = run.checkpoint.pending.first().cloned() {
                let result = self.execute_call(&call, run, ctx).await?;
                run.checkpoint.pending.remove(0);
                if run.checkpoint.pending.is_empty() {
                    run.checkpoint.transition(TurnPhase::Planning);
                }
                self.commit(run, &[Message::tool_result(call.id, result)])?;
            }

            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            let history = self
                .store
                .load(&run.thread_id)?
                .map(|state| state.messages)
                .unwrap_or_default();
            let reply = self.reason(history, &tools, run, ctx).await?;
            let calls = reply.tool_calls().to_vec();

            if calls.is_empty() {
                run.checkpoint.transition(TurnPhase::Synthesizing);
                debug!(thread_id = %run.thread_id, steps = run.checkpoint.step, "synthesizing final answer");
                let final_message = Message::assistant(run.checkpoint.reply.clone());
                run.checkpoint.transition(TurnPhase::Done);
                let message_count = self.commit(run, &[final_message])?;
                info!(
                    thread_id = %run.thread_id,
                    turn_id = %run.checkpoint.turn_id,
                    steps = run.checkpoint.step,
                    "turn complete"
                );
                return Ok(TurnOutcome {
                    turn_id: run.checkpoint.turn_id.clone(),
                    reply: run.checkpoint.reply.clone(),
                    steps: run.checkpoint.step,
                    message_count,
                });
            }

            debug!(thread_id = %run.thread_id, calls = calls.len(), "supervisor requested tool calls");
            run.checkpoint.pending = calls.clone();
            self.commit(run, &[Message::assistant_with_tools("", calls)])?;
        }
    }

    /// One streamed supervisor reasoning step. Text goes straight to the client
    /// and into the turn's reply.
    async fn reason(
        &self,
        history: Vec<Message>,
        tools: &[ToolDefinition],
        run: &mut TurnRun,
        ctx: &TurnContext,
    ) -> Result<Message, EngineError> {
        let llm_ctx = LlmContext::new(SUPERVISOR_PROMPT)
            .with_messages(history)
            .with_tools(tools.to_vec());

        let mut stream = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(EngineError::Aborted),
            opened = self.provider.stream(&llm_ctx, &self.config.stream_options) => opened?,
        };

        let mut reply = None;
        loop {
            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(EngineError::Aborted),
                event = stream.next() => event,
            };
            let Some(event) = event else { break };

            match event {
                StreamEvent::TextDelta { delta } => {
                    run.checkpoint.reply.push_str(&delta);
                    ctx.sink.content(&delta).await?;
                }
                StreamEvent::Done { message, .. } => reply = Some(message),
                StreamEvent::Error { error } => return Err(EngineError::Gateway(error)),
                StreamEvent::Retry {
                    attempt, delay_ms, ..
                } => {
                    debug!(attempt, delay_ms, "provider retrying");
                }
                _ => {}
            }
        }

        reply.ok_or_else(|| {
            EngineError::Gateway(GatewayError::StreamInterrupted(
                "stream ended without a final message".into(),
            ))
        })
    }

    /// Answer one supervisor tool call with the text its tool result carries.
    ///
    /// Tool failures become error results the model can react to. Worker
    /// invocation failures that survive the retry policy end the turn.
    async fn execute_call(
        &self,
        call: &ToolCallBlock,
        run: &mut TurnRun,
        ctx: &TurnContext,
    ) -> Result<String, EngineError> {
        let meta = |phase| ToolCallMeta::new(AgentRole::Supervisor, call.id.clone(), call.name.clone(), phase);

        let delegation = match Delegation::from_call(call) {
            Some(Ok(delegation)) => delegation,
            Some(Err(failure)) => {
                let err = ToolError::execution(call.name.clone(), failure);
                warn!(tool = %call.name, error = %err, "malformed delegation");
                ctx.sink.tool_call(meta(ToolCallPhase::Failed).with_detail(err.to_string())).await?;
                return Ok(err.as_tool_result());
            }
            None => return self.call_tool(call, ctx).await,
        };

        if run.checkpoint.step >= self.config.max_delegation_steps {
            return Err(EngineError::PlanStepLimitExceeded(self.config.max_delegation_steps));
        }
        run.checkpoint.step += 1;
        run.checkpoint.transition(TurnPhase::Delegating(delegation.target));
        info!(
            thread_id = %run.thread_id,
            worker = %delegation.target,
            step = run.checkpoint.step,
            "delegating"
        );
        ctx.sink
            .tool_call(meta(ToolCallPhase::Started).with_detail(delegation.task.clone()))
            .await?;

        match self.delegate(&delegation, call, ctx).await {
            Ok(output) => {
                let text = output.into_text();
                ctx.sink
                    .tool_call(meta(ToolCallPhase::Completed).with_detail(text.clone()))
                    .await?;
                Ok(text)
            }
            Err(WorkerError::MalformedOutput { worker, raw, reason }) => {
                warn!(worker = %worker, reason = %reason, "falling back to raw worker output");
                ctx.sink
                    .tool_call(meta(ToolCallPhase::Completed).with_detail(raw.clone()))
                    .await?;
                Ok(raw)
            }
            Err(e) if e.is_cancelled() => Err(EngineError::Aborted),
            Err(e) => {
                ctx.sink
                    .tool_call(meta(ToolCallPhase::Failed).with_detail(e.to_string()))
                    .await?;
                Err(EngineError::Worker(e))
            }
        }
    }

    async fn delegate(
        &self,
        delegation: &Delegation,
        call: &ToolCallBlock,
        ctx: &TurnContext,
    ) -> Result<WorkerOutput, WorkerError> {
        let worker_ctx = WorkerContext::new(ctx.worker_timeout, ctx.tool_timeout)
            .with_cancel(ctx.cancel.child_token())
            .with_sink(ctx.sink.clone())
            .with_origin(CallOrigin {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
            });
        let policy = &self.config.worker_retry;

        let mut attempt = 1;
        loop {
            match self.team.dispatch(delegation, &worker_ctx).await {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        worker = %delegation.target,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying delegation"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return Err(WorkerError::invocation(delegation.target, WorkerFailure::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn call_tool(&self, call: &ToolCallBlock, ctx: &TurnContext) -> Result<String, EngineError> {
        let meta = |phase| ToolCallMeta::new(AgentRole::Supervisor, call.id.clone(), call.name.clone(), phase);
        let request = ToolCallRequest {
            agent: AgentRole::Supervisor,
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        };

        ctx.sink.tool_call(meta(ToolCallPhase::Started)).await?;
        match self
            .tools
            .invoke(&request, ctx.tool_timeout, self.gate.as_ref())
            .await
        {
            Ok(output) => {
                ctx.sink
                    .tool_call(meta(ToolCallPhase::Completed).with_detail(output.clone()))
                    .await?;
                Ok(output)
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "supervisor tool call failed");
                ctx.sink
                    .tool_call(meta(ToolCallPhase::Failed).with_detail(e.to_string()))
                    .await?;
                Ok(e.as_tool_result())
            }
        }
    }

    /// Append `messages` and the current checkpoint in one store transaction.
    fn commit(&self, run: &mut TurnRun, messages: &[Message]) -> Result<u64, EngineError> {
        let checkpoint = run.checkpoint.to_checkpoint(&run.thread_id, run.next_sequence)?;
        let count = self.store.commit(&run.thread_id, messages, Some(&checkpoint))?;
        run.next_sequence += 1;
        Ok(count)
    }
}
