//! chainfeed-broadcast: fan-out of chain events to WebSocket subscribers.
//!
//! ```text
//! EventListener ──▶ BroadcastService ── serialize once ──▶ ConnectionRegistry
//!                        ▲                                    │
//! TransactionProcessor ──┘ (high-value alerts)                ▼
//!                                         SubscriberConnection (queue + send/recv loops)
//! ```
//!
//! Each connection has a bounded outbound queue. A subscriber that cannot
//! keep up is disconnected instead of slowing down the rest.

pub mod connection;
pub mod error;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod service;

pub use connection::{
    ConnectionConfig, ConnectionObserver, ConnectionState, Frame, FrameSink, FrameStream,
    SubscriberConnection,
};
pub use error::{BroadcastError, ConnectionError, ResolveError};
pub use message::{ClientMessage, Interest, MessageKind, WireMessage};
pub use metrics::{BroadcastMetrics, MetricsSnapshot};
pub use registry::ConnectionRegistry;
pub use resolver::{keccak256_signature, KeccakResolver, SignatureResolver};
pub use service::{BroadcastConfig, BroadcastService};
