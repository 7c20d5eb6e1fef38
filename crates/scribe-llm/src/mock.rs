use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use scribe_core::context::LlmContext;
use scribe_core::errors::GatewayError;
use scribe_core::ids::ToolCallId;
use scribe_core::messages::{Message, StopReason, ToolCallBlock};
use scribe_core::provider::{EventStream, LlmProvider, StreamOptions};
use scribe_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of events.
    Stream(Vec<StreamEvent>),
    /// Yield events with a pause before each one.
    Trickle(Duration, Vec<StreamEvent>),
    /// Fail the `stream()` call itself.
    Error(GatewayError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::text_chunks(&[text])
    }

    /// A text answer delivered as several deltas.
    pub fn text_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::TextDelta {
            delta: c.to_string(),
        }));
        events.push(StreamEvent::Done {
            message: Message::assistant(chunks.concat()),
            stop_reason: StopReason::EndTurn,
        });
        Self::Stream(events)
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::text_then_tool_calls("", vec![(name, arguments)])
    }

    pub fn tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        Self::text_then_tool_calls("", calls)
    }

    /// Some narration followed by one or more tool calls in the same reply.
    pub fn text_then_tool_calls(text: &str, calls: Vec<(&str, serde_json::Value)>) -> Self {
        let mut events = vec![StreamEvent::Start];
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta {
                delta: text.to_string(),
            });
        }
        let mut blocks = Vec::with_capacity(calls.len());
        for (name, arguments) in calls {
            let block = ToolCallBlock {
                id: ToolCallId::new(),
                name: name.to_string(),
                arguments,
            };
            events.push(StreamEvent::ToolCallStart {
                tool_call_id: block.id.clone(),
                name: block.name.clone(),
            });
            events.push(StreamEvent::ToolCallDelta {
                tool_call_id: block.id.clone(),
                arguments_delta: block.arguments.to_string(),
            });
            events.push(StreamEvent::ToolCallEnd {
                tool_call: block.clone(),
            });
            blocks.push(block);
        }
        events.push(StreamEvent::Done {
            message: Message::assistant_with_tools(text, blocks),
            stop_reason: StopReason::ToolUse,
        });
        Self::Stream(events)
    }

    /// A stream that starts and then fails mid-flight.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// Re-time an event stream so each event arrives after `pause`.
    pub fn trickled(self, pause: Duration) -> Self {
        match self {
            Self::Stream(events) | Self::Trickle(_, events) => Self::Trickle(pause, events),
            Self::Delay(d, inner) => Self::Delay(d, Box::new(inner.trickled(pause))),
            other => other,
        }
    }
}

type Responder = dyn Fn(&LlmContext) -> MockResponse + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<MockResponse>>),
    Responder(Box<Responder>),
}

/// Scripted provider: either a FIFO of responses, or a closure that picks a
/// response from the context (useful when several agents share one provider
/// and call it concurrently).
pub struct MockProvider {
    script: Script,
    call_count: AtomicUsize,
    contexts: Mutex<Vec<LlmContext>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::from_script(Script::Queue(Mutex::new(responses.into())))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&LlmContext) -> MockResponse + Send + Sync + 'static,
    {
        Self::from_script(Script::Responder(Box::new(responder)))
    }

    fn from_script(script: Script) -> Self {
        Self {
            script,
            call_count: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every context the provider was called with, in call order.
    pub fn contexts(&self) -> Vec<LlmContext> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        context: &LlmContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(context.clone());

        let response = match &self.script {
            Script::Queue(queue) => queue.lock().pop_front().ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "MockProvider: no response configured for call {idx}"
                ))
            })?,
            Script::Responder(responder) => responder(context),
        };

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(mut current: MockResponse) -> Result<EventStream, GatewayError> {
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Trickle(pause, events) => {
                return Ok(Box::pin(stream::iter(events).then(move |event| async move {
                    tokio::time::sleep(pause).await;
                    event
                })));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
