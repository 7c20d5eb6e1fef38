//! Server-sent event framing for turn streams.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;

use scribe_core::events::TurnEvent;

/// Encode one event as a `data: <json>\n\n` frame.
///
/// Tool-call progress is dropped unless `forward_tool_events` is set.
pub fn frame(event: &TurnEvent, forward_tool_events: bool) -> Option<Bytes> {
    let payload = match event {
        TurnEvent::ContentDelta { text } => json!({ "content": text }),
        TurnEvent::ToolCallDelta(meta) if forward_tool_events => json!({ "tool_call": meta }),
        TurnEvent::ToolCallDelta(_) => return None,
        TurnEvent::Error { message } => json!({ "error": message }),
        TurnEvent::End => json!({ "done": true }),
    };
    Some(Bytes::from(format!("data: {payload}\n\n")))
}

pub fn event_body<S>(events: S, forward_tool_events: bool) -> Body
where
    S: Stream<Item = TurnEvent> + Send + 'static,
{
    let frames = events
        .filter_map(move |event| futures::future::ready(frame(&event, forward_tool_events)))
        .map(Ok::<_, Infallible>);
    Body::from_stream(frames)
}

pub fn sse_response(body: Body) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
