use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use scribe_core::ids::ThreadId;
use scribe_engine::{TurnOverrides, TurnRequest};

use crate::error::ApiError;
use crate::server::AppState;
use crate::sse::{event_body, sse_response};

pub const DEFAULT_THREAD: &str = "default_thread";

fn default_thread() -> String {
    DEFAULT_THREAD.to_string()
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default = "default_thread")]
    pub thread_id: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeParams {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn overrides(timeout_secs: Option<u64>) -> Result<TurnOverrides, ApiError> {
    match timeout_secs {
        Some(0) => Err(ApiError::BadRequest("timeout_secs must be positive".into())),
        Some(secs) => Ok(TurnOverrides {
            timeout: Some(Duration::from_secs(secs)),
        }),
        None => Ok(TurnOverrides::default()),
    }
}

fn thread_id(raw: &str) -> Result<ThreadId, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("thread_id must not be empty".into()));
    }
    Ok(ThreadId::from_raw(trimmed))
}

/// `POST /chat`: run one turn and stream it back as SSE.
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let thread = thread_id(&body.thread_id)?;
    let mut request = TurnRequest::new(body.query, thread);
    request.overrides = overrides(body.timeout_secs)?;

    info!(thread_id = %request.thread_id, "chat request");
    let stream = state.driver.open_stream(request);
    Ok(sse_response(event_body(stream, state.forward_tool_events)))
}

/// `POST /threads/{thread_id}/resume`
pub async fn resume(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Query(params): Query<ResumeParams>,
) -> Result<Response, ApiError> {
    let thread = thread_id(&raw)?;
    let overrides = overrides(params.timeout_secs)?;

    info!(thread_id = %thread, "resume request");
    let stream = state.driver.resume_stream(thread, overrides);
    Ok(sse_response(event_body(stream, state.forward_tool_events)))
}

/// `GET /threads/{thread_id}/messages`
pub async fn messages(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let thread = thread_id(&raw)?;
    let loaded = state.driver.history(&thread)?;
    let Some(thread_state) = loaded else {
        return Err(ApiError::ThreadNotFound(thread.to_string()));
    };
    Ok(Json(json!({
        "thread_id": thread_state.thread_id,
        "messages": thread_state.messages,
        "checkpoint_count": thread_state.checkpoint_count,
    })))
}

/// `GET /threads`
pub async fn threads(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let threads = state
        .driver
        .store()
        .list_threads()
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(json!({ "threads": threads })))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "store": state.driver.store().backend(),
    }))
}
