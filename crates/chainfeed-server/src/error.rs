//! HTTP error mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chainfeed_broadcast::BroadcastError;
use chainfeed_core::ListenerError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Broadcast(e) => match e {
                BroadcastError::Resolve(_) => StatusCode::BAD_REQUEST,
                BroadcastError::DuplicateConnection(_) => StatusCode::CONFLICT,
                BroadcastError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
                BroadcastError::Listener(ListenerError::Stopped) => StatusCode::SERVICE_UNAVAILABLE,
                BroadcastError::Listener(l) if l.is_upstream() => StatusCode::BAD_GATEWAY,
                BroadcastError::Listener(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
