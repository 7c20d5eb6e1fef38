use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use scribe_engine::EngineError;

/// Failures of the non-streaming endpoints.
///
/// Turn failures never come through here: once a stream is open they travel
/// as an `error` frame instead.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::ThreadNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::ThreadNotFound(_) => "thread_not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": { "code": self.code(), "message": self.to_string() }
        }));
        (self.status(), body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::StoreUnavailable(inner) => Self::Unavailable(inner.to_string()),
            EngineError::NothingToResume(thread) => Self::ThreadNotFound(thread.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
