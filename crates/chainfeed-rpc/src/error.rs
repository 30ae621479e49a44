//! Transport-level error types.

use chainfeed_core::FeedError;
use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to the node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A field in a node response had an unexpected shape.
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    /// The client has been shut down.
    #[error("client closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout { .. })
    }

    pub(crate) fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            value: value.into(),
        }
    }
}

impl From<TransportError> for FeedError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => FeedError::Closed,
            TransportError::Deserialization(_) | TransportError::InvalidField { .. } => {
                FeedError::Malformed(e.to_string())
            }
            other => FeedError::Other(other.to_string()),
        }
    }
}
