//! Error types for the fan-out hub.

use chainfeed_core::ListenerError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a [`SubscriberConnection`](crate::connection::SubscriberConnection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The outbound queue is saturated. The caller tears the connection down.
    #[error("outbound queue full")]
    QueueFull,

    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame was not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Errors raised by the [`SignatureResolver`](crate::resolver::SignatureResolver).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("empty event signature")]
    Empty,

    #[error("invalid topic hash: {0}")]
    InvalidTopic(String),
}

/// Errors raised by the [`BroadcastService`](crate::service::BroadcastService).
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("connection {0} is already registered")]
    DuplicateConnection(Uuid),

    #[error("cannot resolve event signature: {0}")]
    Resolve(#[from] ResolveError),

    #[error("broadcast service has been stopped")]
    Stopped,
}
