//! chainfeed-rpc: Ethereum JSON-RPC WebSocket implementation of `UpstreamFeed`.
//!
//! # Features
//! - `eth_subscribe` newHeads / logs, `eth_getBlockByHash`, `eth_unsubscribe`
//! - Auto-reconnect on disconnect (exponential backoff)
//! - Auto-resubscribe after reconnect behind stable subscription ids
//! - Request multiplexing over a single connection

pub mod client;
pub mod error;
pub mod parse;
pub mod request;
pub mod subscriptions;

pub use client::{WsClientConfig, WsRpcClient};
pub use error::TransportError;
pub use subscriptions::SubscriptionManager;
