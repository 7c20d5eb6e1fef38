//! Server-sent-event decoding for OpenAI-compatible chat-completion streams.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;

use scribe_core::errors::GatewayError;
use scribe_core::ids::ToolCallId;
use scribe_core::messages::{Message, StopReason, ToolCallBlock};
use scribe_core::stream::StreamEvent;

const DONE_SENTINEL: &str = "[DONE]";

/// Extract the `data:` payloads of complete SSE events in `raw`.
///
/// Multi-line data fields are joined with `\n`; comments and other fields are ignored.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    let mut assembler = EventAssembler::default();
    let mut payloads: Vec<String> = raw.lines().filter_map(|line| assembler.push_line(line)).collect();
    payloads.extend(assembler.finish());
    payloads
}

/// Collects `data:` lines until the blank line that ends an event.
#[derive(Default)]
struct EventAssembler {
    data: Option<String>,
}

impl EventAssembler {
    /// Feed one line without its terminator; returns the payload an empty line completes.
    fn push_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.data.take();
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match self.data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => self.data = Some(data.to_string()),
            }
        }
        None
    }

    fn finish(&mut self) -> Option<String> {
        self.data.take()
    }
}

/// Folds chat-completion chunks into provider stream events.
#[derive(Default)]
pub struct ChunkParser {
    started: bool,
    finished: bool,
    text: String,
    tools: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn saw_finish_reason(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Parse one `data:` payload.
    pub fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if data.trim() == DONE_SENTINEL {
            return self.finish();
        }

        let chunk: Chunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.finished = true;
                return vec![StreamEvent::Error {
                    error: GatewayError::StreamInterrupted(format!("malformed chunk: {e}")),
                }];
            }
        };

        if let Some(err) = chunk.error {
            self.finished = true;
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return vec![StreamEvent::Error {
                error: GatewayError::ServerError { status: 500, body: message },
            }];
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.text.push_str(&content);
                events.push(StreamEvent::TextDelta { delta: content });
            }

            for call in choice.delta.tool_calls.unwrap_or_default() {
                let entry = self.tools.entry(call.index).or_default();
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    entry.id = id;
                }
                if let Some(function) = call.function {
                    let fresh = entry.name.is_empty();
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        entry.name.push_str(&name);
                        if fresh {
                            if entry.id.is_empty() {
                                entry.id = ToolCallId::new().to_string();
                            }
                            events.push(StreamEvent::ToolCallStart {
                                tool_call_id: ToolCallId::from_raw(&entry.id),
                                name: entry.name.clone(),
                            });
                        }
                    }
                    if let Some(args) = function.arguments.filter(|a| !a.is_empty()) {
                        entry.arguments.push_str(&args);
                        events.push(StreamEvent::ToolCallDelta {
                            tool_call_id: ToolCallId::from_raw(&entry.id),
                            arguments_delta: args,
                        });
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        events
    }

    /// Close out the stream: emit completed tool calls and the final message.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(StreamEvent::Start);
        }

        let mut blocks = Vec::with_capacity(self.tools.len());
        for partial in std::mem::take(&mut self.tools).into_values() {
            let arguments = if partial.arguments.trim().is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&partial.arguments).unwrap_or(Value::String(partial.arguments))
            };
            let block = ToolCallBlock {
                id: ToolCallId::from_raw(partial.id),
                name: partial.name,
                arguments,
            };
            events.push(StreamEvent::ToolCallEnd {
                tool_call: block.clone(),
            });
            blocks.push(block);
        }

        let stop_reason = match self.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            _ if !blocks.is_empty() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };

        events.push(StreamEvent::Done {
            message: Message::assistant_with_tools(std::mem::take(&mut self.text), blocks),
            stop_reason,
        });
        events
    }
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Turns a response byte stream into provider events.
///
/// Bytes are buffered raw and decoded one complete line at a time, so a
/// multi-byte character split across network chunks arrives intact. If no
/// bytes arrive within the idle timeout the stream yields a
/// `StreamInterrupted` error and ends.
pub struct SseStream {
    inner: ByteStream,
    parser: ChunkParser,
    buffer: BytesMut,
    assembler: EventAssembler,
    pending: VecDeque<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    closed: bool,
}

impl SseStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChunkParser::new(),
            buffer: BytesMut::with_capacity(8192),
            assembler: EventAssembler::default(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            closed: false,
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.feed_line(&line[..pos]);
        }
    }

    fn feed_line(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if let Some(data) = self.assembler.push_line(&line) {
            self.dispatch(&data);
        }
    }

    fn dispatch(&mut self, data: &str) {
        let events = self.parser.parse_data(data);
        self.pending.extend(events);
    }

    fn close_with(&mut self, event: StreamEvent) -> Poll<Option<StreamEvent>> {
        self.closed = true;
        Poll::Ready(Some(event))
    }
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.closed = true;
                    self.pending.clear();
                }
                return Poll::Ready(Some(event));
            }
            if self.closed {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_complete_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.close_with(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    });
                }
                Poll::Ready(None) => {
                    let remaining = self.buffer.split();
                    if !remaining.is_empty() {
                        self.feed_line(&remaining);
                    }
                    if let Some(data) = self.assembler.finish() {
                        self.dispatch(&data);
                    }
                    if !self.parser.is_finished() {
                        if self.parser.saw_finish_reason() {
                            let events = self.parser.finish();
                            self.pending.extend(events);
                        } else {
                            self.pending.push_back(StreamEvent::Error {
                                error: GatewayError::StreamInterrupted(
                                    "stream ended before completion".into(),
                                ),
                            });
                        }
                    }
                    if self.pending.is_empty() {
                        self.closed = true;
                    }
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        return self.close_with(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {secs}s"
                            )),
                        });
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn run(parser: &mut ChunkParser, payloads: &[&str]) -> Vec<StreamEvent> {
        payloads.iter().flat_map(|p| parser.parse_data(p)).collect()
    }

    #[test]
    fn data_lines_are_extracted() {
        let raw = "data: {\"a\":1}\n\n: keep-alive\n\ndata: [DONE]\n\n";
        assert_eq!(parse_sse_lines(raw), vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        assert_eq!(parse_sse_lines("data: a\ndata: b\n\n"), vec!["a\nb".to_string()]);
    }

    #[test]
    fn text_chunks_become_deltas_and_done() {
        let mut parser = ChunkParser::new();
        let events = run(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
                r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        );
        assert!(matches!(events[0], StreamEvent::Start));
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "Hello");
        match events.last().unwrap() {
            StreamEvent::Done { message, stop_reason } => {
                assert_eq!(message.content(), "Hello");
                assert_eq!(*stop_reason, StopReason::EndTurn);
            }
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(parser.is_finished());
    }

    #[test]
    fn tool_call_fragments_are_accumulated_by_index() {
        let mut parser = ChunkParser::new();
        let events = run(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"delegate_to_writer","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"request\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"a poem\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolCallStart { name, .. } if name == "delegate_to_writer"
        )));
        let StreamEvent::Done { message, stop_reason } = events.last().unwrap() else {
            panic!("expected Done");
        };
        assert_eq!(*stop_reason, StopReason::ToolUse);
        let call = &message.tool_calls()[0];
        assert_eq!(call.id.as_str(), "call_a");
        assert_eq!(call.arguments["request"], "a poem");
    }

    #[test]
    fn provider_error_chunk_becomes_error_event() {
        let mut parser = ChunkParser::new();
        let events = run(&mut parser, &[r#"{"error":{"message":"quota exceeded"}}"#]);
        assert!(matches!(
            &events[0],
            StreamEvent::Error { error: GatewayError::ServerError { body, .. } } if body == "quota exceeded"
        ));
        assert!(parser.parse_data("[DONE]").is_empty());
    }

    #[tokio::test]
    async fn byte_stream_split_across_chunks() {
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n")),
            Ok(Bytes::from("\ndata: [DO")),
            Ok(Bytes::from("NE]\n\n")),
        ];
        let events: Vec<_> = SseStream::new(futures::stream::iter(parts), Duration::from_secs(5))
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "hi"));
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"写作\"}}]}\r\n\r\ndata: [DONE]\n\n";
        let bytes = frame.as_bytes();
        // One byte into the first character.
        let cut = frame.find('写').unwrap() + 1;
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..cut])),
            Ok(Bytes::copy_from_slice(&bytes[cut..])),
        ];
        let events: Vec<_> = SseStream::new(futures::stream::iter(parts), Duration::from_secs(5))
            .collect()
            .await;
        assert!(
            matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "写作"),
            "{events:?}"
        );
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn final_event_without_trailing_blank_line_is_parsed() {
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n")),
            Ok(Bytes::from("data: [DONE]")),
        ];
        let events: Vec<_> = SseStream::new(futures::stream::iter(parts), Duration::from_secs(5))
            .collect()
            .await;
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn truncated_stream_reports_interruption() {
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![Ok(Bytes::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
        ))];
        let events: Vec<_> = SseStream::new(futures::stream::iter(parts), Duration::from_secs(5))
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { error: GatewayError::StreamInterrupted(_) })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_when_no_data() {
        let byte_stream = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::new(byte_stream, Duration::from_secs(5)));
        let event = stream.next().await;
        assert!(
            matches!(&event, Some(StreamEvent::Error { error: GatewayError::StreamInterrupted(msg) }) if msg.contains("idle timeout")),
            "expected idle timeout, got {event:?}"
        );
        assert!(stream.next().await.is_none());
    }
}
