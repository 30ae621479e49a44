//! chainfeed-core: event model and ingestion pipeline for ChainFeed.
//!
//! # Architecture
//!
//! ```text
//! UpstreamFeed (newHeads / logs / getBlockByHash)
//!      │
//!      ▼
//! EventListener ── normalize ──▶ Event { NewBlock | NewTransaction | ContractLog }
//!      │                              │
//!      │ per-handler work queues      ▼
//!      ├──────────────────────▶ EventHandler (e.g. BroadcastService)
//!      ▼
//! TransactionProcessor ── enrich + FilterSet ──▶ TransactionHandler
//! ```

pub mod error;
pub mod event;
pub mod feed;
pub mod filter;
pub mod handler;
pub mod listener;
pub mod processor;
pub mod transaction;
pub mod types;

mod dispatch;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{EventError, FeedError, ListenerError};
pub use event::{Event, EventKind, EventPayload};
pub use feed::{FeedStream, FeedSubscription, SubscriptionId, UpstreamFeed};
pub use filter::{FilterId, FilterSet, TransactionFilter};
pub use handler::{handler_fn, tx_handler_fn, EventHandler, FnHandler, TransactionHandler};
pub use listener::{EventListener, ListenerConfig};
pub use processor::TransactionProcessor;
pub use transaction::{ReportedSender, SenderRecovery, TransactionInfo};
pub use types::{Block, BlockHeader, Log, LogFilter, Transaction};
