//! Error types for the event pipeline.

use alloy_primitives::B256;
use thiserror::Error;

use crate::feed::SubscriptionId;

/// Errors raised by an [`UpstreamFeed`](crate::feed::UpstreamFeed).
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to open {kind} subscription: {reason}")]
    Subscribe { kind: String, reason: String },

    #[error("failed to fetch block {hash}: {reason}")]
    Fetch { hash: B256, reason: String },

    #[error("block {hash} not found")]
    BlockNotFound { hash: B256 },

    #[error("failed to cancel subscription {id}: {reason}")]
    Unsubscribe { id: SubscriptionId, reason: String },

    #[error("malformed notification: {0}")]
    Malformed(String),

    #[error("upstream connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Errors raised while constructing an [`Event`](crate::event::Event).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event for block {hash} carries block number zero")]
    ZeroBlockNumber { hash: B256 },
}

/// Errors surfaced by the listener and the transaction processor.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("upstream feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("already started")]
    AlreadyStarted,

    #[error("listener has been stopped")]
    Stopped,
}

impl ListenerError {
    /// Returns `true` if the failure came from the upstream feed rather than
    /// from lifecycle misuse.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Feed(_))
    }
}
