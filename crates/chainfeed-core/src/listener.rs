//! `EventListener`: turns upstream subscriptions into dispatched events.
//!
//! # Ordering
//!
//! Blocks are processed one at a time: for each new head the full block is
//! fetched, then one `NewBlock` event is dispatched, followed by one
//! `NewTransaction` event per transaction in block order. Contract-log
//! subscriptions run in their own loops and interleave freely with blocks.
//!
//! # Lifecycle
//!
//! `start()` may be called once. `stop()` cancels every loop, unsubscribes
//! every upstream subscription and waits for the loops to exit. Once
//! stopped, the listener cannot be restarted.

use alloy_primitives::{Address, B256};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{Delivery, HandlerWorker};
use crate::error::{FeedError, ListenerError};
use crate::event::{Event, EventKind};
use crate::feed::{FeedStream, SubscriptionId, UpstreamFeed};
use crate::handler::EventHandler;
use crate::types::{BlockHeader, Log, LogFilter};

fn default_queue_capacity() -> usize {
    1024
}

/// Configuration for the listener's handler workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Capacity of each handler registration's work queue.
    #[serde(default = "default_queue_capacity")]
    pub handler_queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            handler_queue_capacity: default_queue_capacity(),
        }
    }
}

type Workers = Vec<Arc<HandlerWorker<Event>>>;

/// Normalizes upstream notifications and dispatches them to handlers.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct EventListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    feed: Arc<dyn UpstreamFeed>,
    config: ListenerConfig,
    handlers: RwLock<HashMap<EventKind, Workers>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl EventListener {
    pub fn new(feed: Arc<dyn UpstreamFeed>) -> Self {
        Self::with_config(feed, ListenerConfig::default())
    }

    pub fn with_config(feed: Arc<dyn UpstreamFeed>, config: ListenerConfig) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                feed,
                config,
                handlers: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(JoinSet::new()),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Register `handler` for every future event of `kind`.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.subscribe_all(&[kind], handler).await
    }

    /// Register one handler for several kinds.
    ///
    /// The handler gets a single queue shared by all of `kinds`, so it sees
    /// events in the order the listener emitted them.
    pub async fn subscribe_all(&self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) {
        let worker = Arc::new(HandlerWorker::spawn(
            handler,
            self.inner.config.handler_queue_capacity,
            self.inner.cancel.child_token(),
        ));
        let mut handlers = self.inner.handlers.write().await;
        for kind in kinds {
            handlers.entry(*kind).or_default().push(worker.clone());
        }
        debug!(handler = worker.name(), ?kinds, "handler registered");
    }

    /// Number of handler registrations for `kind`.
    pub async fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .await
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Events dropped across all registrations because a handler's queue
    /// was full.
    pub async fn dropped_events(&self) -> u64 {
        let handlers = self.inner.handlers.read().await;
        let mut seen: Vec<&Arc<HandlerWorker<Event>>> = Vec::new();
        for worker in handlers.values().flatten() {
            if !seen.iter().any(|w| Arc::ptr_eq(w, worker)) {
                seen.push(worker);
            }
        }
        seen.iter().map(|w| w.dropped()).sum()
    }

    /// Open the new-head subscription and start emitting block and
    /// transaction events.
    pub async fn start(&self) -> Result<(), ListenerError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ListenerError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyStarted);
        }

        let sub = self.inner.feed.subscribe_new_heads().await?;
        self.inner.track(sub.id.clone()).await?;

        let inner = self.inner.clone();
        self.inner
            .tasks
            .lock()
            .await
            .spawn(async move { inner.run_block_loop(sub.stream).await });

        info!(feed = self.inner.feed.name(), subscription = %sub.id, "event listener started");
        Ok(())
    }

    /// Open a log subscription for `address`, optionally constrained to the
    /// given topic-0 values, and emit one `ContractLog` event per log.
    pub async fn subscribe_to_contract_events(
        &self,
        address: Address,
        topics: Vec<B256>,
    ) -> Result<SubscriptionId, ListenerError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ListenerError::Stopped);
        }

        let mut filter = LogFilter::address(address);
        if !topics.is_empty() {
            filter = filter.topic0(topics);
        }
        let sub = self.inner.feed.subscribe_logs(filter).await?;
        self.inner.track(sub.id.clone()).await?;

        let inner = self.inner.clone();
        let id = sub.id.clone();
        self.inner
            .tasks
            .lock()
            .await
            .spawn(async move { inner.run_log_loop(id, sub.stream).await });

        info!(%address, subscription = %sub.id, "subscribed to contract events");
        Ok(sub.id)
    }

    /// Number of upstream subscriptions currently held.
    pub async fn open_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().await.len()
    }

    /// Whether upstream subscription `id` is still held.
    pub async fn is_subscribed(&self, id: &SubscriptionId) -> bool {
        self.inner.subscriptions.lock().await.contains(id)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel every loop, release every upstream subscription and wait for
    /// the loops to exit. Idempotent.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        let ids: Vec<SubscriptionId> = self.inner.subscriptions.lock().await.drain(..).collect();
        for id in &ids {
            if let Err(e) = self.inner.feed.unsubscribe(id).await {
                warn!(subscription = %id, error = %e, "failed to unsubscribe");
            }
        }

        let mut tasks = self.inner.tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "listener loop ended abnormally");
            }
        }

        if !ids.is_empty() {
            info!(released = ids.len(), "event listener stopped");
        }
    }
}

impl ListenerInner {
    /// Record an upstream subscription. If `stop()` already ran, release it
    /// immediately instead so nothing stays subscribed.
    async fn track(&self, id: SubscriptionId) -> Result<(), ListenerError> {
        let mut subs = self.subscriptions.lock().await;
        if self.cancel.is_cancelled() {
            drop(subs);
            if let Err(e) = self.feed.unsubscribe(&id).await {
                warn!(subscription = %id, error = %e, "failed to unsubscribe");
            }
            return Err(ListenerError::Stopped);
        }
        subs.push(id);
        Ok(())
    }

    async fn untrack(&self, id: &SubscriptionId) {
        self.subscriptions.lock().await.retain(|s| s != id);
    }

    async fn run_block_loop(self: Arc<Self>, mut stream: FeedStream<BlockHeader>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(header)) => self.process_header(header).await,
                Some(Err(FeedError::Closed)) | None => {
                    warn!("new-head subscription ended");
                    break;
                }
                Some(Err(e)) => warn!(error = %e, "bad new-head notification"),
            }
        }
        debug!("block loop exited");
    }

    async fn process_header(&self, header: BlockHeader) {
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            res = self.feed.block_by_hash(header.hash) => res,
        };
        let block = match fetched {
            Ok(block) => Arc::new(block),
            Err(e) => {
                warn!(number = header.number, hash = %header.hash, error = %e, "skipping block");
                return;
            }
        };

        let block_event = match Event::new_block(block.clone()) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "skipping block");
                return;
            }
        };
        debug!(number = block.number, txs = block.tx_count(), "block received");
        if !self.dispatch(Arc::new(block_event)).await {
            return;
        }

        for tx in &block.transactions {
            match Event::new_transaction(block.hash, block.number, tx.clone()) {
                Ok(ev) => {
                    if !self.dispatch(Arc::new(ev)).await {
                        return;
                    }
                }
                Err(e) => warn!(tx = %tx.hash, error = %e, "skipping transaction"),
            }
        }
    }

    async fn run_log_loop(self: Arc<Self>, id: SubscriptionId, mut stream: FeedStream<Log>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(log)) => {
                    if log.removed {
                        debug!(tx = %log.transaction_hash, "skipping removed log");
                        continue;
                    }
                    match Event::contract_log(log) {
                        Ok(ev) => {
                            if !self.dispatch(Arc::new(ev)).await {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "skipping log"),
                    }
                }
                Some(Err(FeedError::Closed)) | None => {
                    warn!(subscription = %id, "log subscription ended");
                    self.untrack(&id).await;
                    break;
                }
                Some(Err(e)) => warn!(subscription = %id, error = %e, "bad log notification"),
            }
        }
        debug!(subscription = %id, "log loop exited");
    }

    /// Offer `event` to every worker registered for its kind without
    /// waiting on any of them. Returns `false` once the listener has been
    /// cancelled.
    async fn dispatch(&self, event: Arc<Event>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let handlers = self.handlers.read().await;
        let Some(workers) = handlers.get(&event.kind()) else {
            return true;
        };
        for worker in workers {
            if worker.deliver(event.clone()) == Delivery::Closed {
                debug!(handler = worker.name(), "handler worker gone");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::mock::{sample_block, sample_log, MockFeed};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Seen = mpsc::UnboundedReceiver<(EventKind, u64, Option<B256>)>;

    async fn recording_listener(feed: Arc<MockFeed>, kinds: &[EventKind]) -> (EventListener, Seen) {
        let listener = EventListener::new(feed);
        let (tx, rx) = mpsc::unbounded_channel();
        listener
            .subscribe_all(
                kinds,
                Arc::new(handler_fn("recorder", move |ev: Arc<Event>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((ev.kind(), ev.block_number(), ev.tx_hash()));
                    }
                })),
            )
            .await;
        (listener, rx)
    }

    async fn next(rx: &mut Seen) -> (EventKind, u64, Option<B256>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn emits_block_then_transactions_in_order() {
        let feed = Arc::new(MockFeed::new());
        let (listener, mut rx) =
            recording_listener(feed.clone(), &[EventKind::NewBlock, EventKind::NewTransaction]).await;
        listener.start().await.unwrap();

        let blocks: Vec<_> = (1..=3).map(|n| sample_block(n, n as usize)).collect();
        for block in &blocks {
            feed.announce(block.clone());
        }

        for block in &blocks {
            assert_eq!(next(&mut rx).await, (EventKind::NewBlock, block.number, None));
            for tx in &block.transactions {
                assert_eq!(
                    next(&mut rx).await,
                    (EventKind::NewTransaction, block.number, Some(tx.hash))
                );
            }
        }
        listener.stop().await;
    }

    #[tokio::test]
    async fn failed_fetch_skips_block_only() {
        let feed = Arc::new(MockFeed::new());
        let (listener, mut rx) = recording_listener(feed.clone(), &[EventKind::NewBlock]).await;
        listener.start().await.unwrap();

        let bad = sample_block(1, 0);
        feed.fail_block(bad.hash);
        feed.announce(bad);
        feed.announce(sample_block(2, 0));

        assert_eq!(next(&mut rx).await, (EventKind::NewBlock, 2, None));
        listener.stop().await;
    }

    #[tokio::test]
    async fn failed_subscription_fails_start() {
        let feed = Arc::new(MockFeed::new());
        feed.fail_subscriptions(true);
        let listener = EventListener::new(feed.clone());

        let err = listener.start().await.unwrap_err();
        assert!(err.is_upstream());
        assert_eq!(listener.open_subscriptions().await, 0);
        assert_eq!(feed.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn start_twice_or_after_stop_is_rejected() {
        let feed = Arc::new(MockFeed::new());
        let listener = EventListener::new(feed.clone());
        listener.start().await.unwrap();
        assert!(matches!(listener.start().await, Err(ListenerError::AlreadyStarted)));

        listener.stop().await;
        let fresh = EventListener::new(feed);
        fresh.stop().await;
        assert!(matches!(fresh.start().await, Err(ListenerError::Stopped)));
    }

    #[tokio::test]
    async fn contract_logs_skip_removed() {
        let feed = Arc::new(MockFeed::new());
        let (listener, mut rx) = recording_listener(feed.clone(), &[EventKind::ContractLog]).await;
        let contract = Address::repeat_byte(0xcc);
        listener
            .subscribe_to_contract_events(contract, vec![])
            .await
            .unwrap();

        let mut removed = sample_log(contract, 8, 0);
        removed.removed = true;
        feed.emit_log(removed);
        let kept = sample_log(contract, 9, 1);
        feed.emit_log(kept.clone());

        assert_eq!(
            next(&mut rx).await,
            (EventKind::ContractLog, 9, Some(kept.transaction_hash))
        );
        listener.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_every_subscription_and_is_idempotent() {
        let feed = Arc::new(MockFeed::new());
        let listener = EventListener::new(feed.clone());
        listener.start().await.unwrap();
        let logs = listener
            .subscribe_to_contract_events(Address::repeat_byte(0x01), vec![B256::repeat_byte(0x02)])
            .await
            .unwrap();
        assert_eq!(listener.open_subscriptions().await, 2);
        assert_eq!(feed.open_subscriptions(), 2);
        assert!(listener.is_subscribed(&logs).await);

        listener.stop().await;
        assert!(!listener.is_subscribed(&logs).await);
        assert_eq!(listener.open_subscriptions().await, 0);
        assert_eq!(feed.open_subscriptions(), 0);

        listener.stop().await;
        assert!(listener.is_stopped());
        assert!(matches!(
            listener.subscribe_to_contract_events(Address::ZERO, vec![]).await,
            Err(ListenerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn every_handler_for_a_kind_is_invoked() {
        let feed = Arc::new(MockFeed::new());
        let listener = EventListener::new(feed.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in ["a", "b"] {
            let tx = tx.clone();
            listener
                .subscribe(
                    EventKind::NewBlock,
                    Arc::new(handler_fn(name, move |_ev: Arc<Event>| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(name);
                        }
                    })),
                )
                .await;
        }
        assert_eq!(listener.handler_count(EventKind::NewBlock).await, 2);
        listener.start().await.unwrap();
        feed.announce(sample_block(4, 0));

        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(
                tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
        listener.stop().await;
    }

    #[tokio::test]
    async fn stuck_handler_does_not_stall_the_others() {
        let feed = Arc::new(MockFeed::new());
        let listener = EventListener::with_config(
            feed.clone(),
            ListenerConfig {
                handler_queue_capacity: 2,
            },
        );
        listener
            .subscribe(
                EventKind::NewBlock,
                Arc::new(handler_fn("stuck", |_ev: Arc<Event>| {
                    std::future::pending::<()>()
                })),
            )
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .subscribe(
                EventKind::NewBlock,
                Arc::new(handler_fn("healthy", move |ev: Arc<Event>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(ev.block_number());
                    }
                })),
            )
            .await;
        listener.start().await.unwrap();

        for n in 1..=10 {
            feed.announce(sample_block(n, 0));
            // keep the healthy queue from overflowing on its own
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("healthy handler stalled")
                .unwrap();
            assert_eq!(got, n);
        }
        // the stuck handler holds one block and queues two more, give or
        // take whether it had picked up the first before the second arrived
        let dropped = listener.dropped_events().await;
        assert!((7..=8).contains(&dropped), "dropped {dropped}");
        listener.stop().await;
    }
}
