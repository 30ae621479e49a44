//! In-memory [`UpstreamFeed`] for tests.
//!
//! Blocks are announced by the test, logs are pushed to every matching log
//! subscription, and individual block fetches can be made to fail.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::FeedError;
use crate::feed::{FeedSubscription, SubscriptionId, UpstreamFeed};
use crate::types::{Block, BlockHeader, Log, LogFilter, Transaction};

type Sink<T> = UnboundedSender<Result<T, FeedError>>;

#[derive(Default)]
struct MockState {
    next_id: u64,
    blocks: HashMap<B256, Block>,
    failing: HashSet<B256>,
    heads: HashMap<SubscriptionId, Sink<BlockHeader>>,
    logs: HashMap<SubscriptionId, (LogFilter, Sink<Log>)>,
    fail_subscriptions: bool,
}

impl MockState {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(format!("0x{:x}", self.next_id))
    }
}

/// Scriptable upstream feed.
#[derive(Default)]
pub struct MockFeed {
    state: Mutex<MockState>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every future subscribe call fail (or succeed again).
    pub fn fail_subscriptions(&self, fail: bool) {
        self.state().fail_subscriptions = fail;
    }

    /// Store `block` so it can be fetched, without announcing it.
    pub fn insert_block(&self, block: Block) {
        self.state().blocks.insert(block.hash, block);
    }

    /// Make fetches of `hash` fail.
    pub fn fail_block(&self, hash: B256) {
        self.state().failing.insert(hash);
    }

    /// Store `block` and push its header to every new-head subscription.
    /// Returns the number of subscriptions notified.
    pub fn announce(&self, block: Block) -> usize {
        let header = block.header();
        let mut state = self.state();
        state.blocks.insert(block.hash, block);
        state
            .heads
            .values()
            .filter(|sink| sink.unbounded_send(Ok(header.clone())).is_ok())
            .count()
    }

    /// Push `log` to every log subscription whose filter matches it.
    pub fn emit_log(&self, log: Log) -> usize {
        let state = self.state();
        state
            .logs
            .values()
            .filter(|(filter, _)| filter.matches(&log))
            .filter(|(_, sink)| sink.unbounded_send(Ok(log.clone())).is_ok())
            .count()
    }

    /// End every open subscription stream, as if the node went away.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.heads.clear();
        state.logs.clear();
    }

    /// Number of subscriptions not yet cancelled.
    pub fn open_subscriptions(&self) -> usize {
        let state = self.state();
        state.heads.len() + state.logs.len()
    }
}

#[async_trait]
impl UpstreamFeed for MockFeed {
    fn name(&self) -> &str {
        "mock"
    }

    async fn subscribe_new_heads(&self) -> Result<FeedSubscription<BlockHeader>, FeedError> {
        let mut state = self.state();
        if state.fail_subscriptions {
            return Err(FeedError::Subscribe {
                kind: "newHeads".into(),
                reason: "mock failure".into(),
            });
        }
        let id = state.next_id();
        let (tx, rx) = unbounded();
        state.heads.insert(id.clone(), tx);
        Ok(FeedSubscription {
            id,
            stream: Box::pin(rx),
        })
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Block, FeedError> {
        let state = self.state();
        if state.failing.contains(&hash) {
            return Err(FeedError::Fetch {
                hash,
                reason: "mock failure".into(),
            });
        }
        state
            .blocks
            .get(&hash)
            .cloned()
            .ok_or(FeedError::BlockNotFound { hash })
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<FeedSubscription<Log>, FeedError> {
        let mut state = self.state();
        if state.fail_subscriptions {
            return Err(FeedError::Subscribe {
                kind: "logs".into(),
                reason: "mock failure".into(),
            });
        }
        let id = state.next_id();
        let (tx, rx) = unbounded();
        state.logs.insert(id.clone(), (filter, tx));
        Ok(FeedSubscription {
            id,
            stream: Box::pin(rx),
        })
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), FeedError> {
        let mut state = self.state();
        let removed = state.heads.remove(id).is_some() || state.logs.remove(id).is_some();
        if removed {
            Ok(())
        } else {
            Err(FeedError::Unsubscribe {
                id: id.clone(),
                reason: "unknown subscription".into(),
            })
        }
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// Deterministic hash for block `number`.
pub fn hash_of(number: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xb1;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

fn tx_hash_of(number: u64, index: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x7a;
    bytes[16..24].copy_from_slice(&number.to_be_bytes());
    bytes[24..].copy_from_slice(&index.to_be_bytes());
    B256::from(bytes)
}

/// A block with `tx_count` plain transfers. Transaction `i` carries a
/// value of `i` wei.
pub fn sample_block(number: u64, tx_count: usize) -> Block {
    let transactions = (0..tx_count as u64)
        .map(|i| Transaction {
            hash: tx_hash_of(number, i),
            transaction_index: i,
            from: Some(Address::repeat_byte(0x11)),
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(i),
            gas_price: U256::from(1_000_000_000u64),
            gas: 21_000,
            nonce: i,
            input: Bytes::new(),
        })
        .collect();
    Block {
        number,
        hash: hash_of(number),
        parent_hash: hash_of(number.saturating_sub(1)),
        timestamp: 1_700_000_000 + number * 12,
        gas_used: 21_000 * tx_count as u64,
        gas_limit: 30_000_000,
        transactions,
    }
}

/// A log from `address` in block `number`.
pub fn sample_log(address: Address, number: u64, log_index: u64) -> Log {
    Log {
        address,
        topics: vec![B256::repeat_byte(0xee)],
        data: Bytes::new(),
        block_number: number,
        block_hash: hash_of(number),
        transaction_hash: tx_hash_of(number, log_index),
        log_index,
        removed: false,
    }
}
