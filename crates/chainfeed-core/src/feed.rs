//! `UpstreamFeed` trait: abstraction over the blockchain node connection.
//!
//! The listener consumes a feed through this trait only. The WebSocket
//! JSON-RPC implementation lives in `chainfeed-rpc`; tests use the
//! in-memory `MockFeed`.

use alloy_primitives::B256;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use crate::error::FeedError;
use crate::types::{Block, BlockHeader, Log, LogFilter};

/// A stream of notifications from one upstream subscription.
pub type FeedStream<T> = Pin<Box<dyn Stream<Item = Result<T, FeedError>> + Send>>;

/// Opaque handle for an upstream subscription, used to cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An open upstream subscription: its handle plus the notification stream.
pub struct FeedSubscription<T> {
    pub id: SubscriptionId,
    pub stream: FeedStream<T>,
}

impl<T> fmt::Debug for FeedSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSubscription").field("id", &self.id).finish()
    }
}

/// Abstracts over different node connections.
#[async_trait]
pub trait UpstreamFeed: Send + Sync + 'static {
    /// Human-readable name used in logs (e.g. the endpoint URL).
    fn name(&self) -> &str;

    /// Open a new-head subscription.
    async fn subscribe_new_heads(&self) -> Result<FeedSubscription<BlockHeader>, FeedError>;

    /// Fetch a full block, including its transactions, by hash.
    async fn block_by_hash(&self, hash: B256) -> Result<Block, FeedError>;

    /// Open a log subscription scoped to `filter`.
    async fn subscribe_logs(&self, filter: LogFilter) -> Result<FeedSubscription<Log>, FeedError>;

    /// Cancel a subscription previously returned by this feed.
    ///
    /// The subscription's stream ends once the cancel takes effect.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), FeedError>;
}
