//! `BroadcastService`: the hub between the listener and subscribers.
//!
//! Every chain event and every processor match is serialized once and
//! offered to each registered connection whose interest admits it. A
//! connection whose queue is full is torn down on the spot; the others
//! are unaffected.

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use chainfeed_core::{
    Event, EventHandler, EventKind, EventListener, FilterId, ListenerError, SubscriptionId,
    TransactionFilter, TransactionHandler, TransactionInfo, TransactionProcessor,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{
    ConnectionConfig, ConnectionObserver, FrameSink, FrameStream, SubscriberConnection,
};
use crate::error::{BroadcastError, ConnectionError};
use crate::message::WireMessage;
use crate::metrics::{BroadcastMetrics, MetricsSnapshot};
use crate::registry::ConnectionRegistry;
use crate::resolver::{KeccakResolver, SignatureResolver};

fn default_probe_interval() -> u64 {
    30
}

fn one_ether() -> Option<U256> {
    Some(U256::from(10u64).pow(U256::from(18u64)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Liveness probe period per connection, in seconds.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Minimum value (wei) of the filter installed at start. `None` installs
    /// no default filter.
    #[serde(default = "one_ether")]
    pub high_value_threshold: Option<U256>,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            high_value_threshold: one_ether(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Fans chain events out to subscriber connections.
#[derive(Clone)]
pub struct BroadcastService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    listener: EventListener,
    processor: TransactionProcessor,
    registry: ConnectionRegistry,
    resolver: Arc<dyn SignatureResolver>,
    config: BroadcastConfig,
    metrics: BroadcastMetrics,
    /// Upstream log subscriptions keyed by contract and sorted topic set,
    /// shared by every request for the same pair.
    contract_subs: Mutex<HashMap<(Address, Vec<B256>), SubscriptionId>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl BroadcastService {
    pub fn new(
        listener: EventListener,
        processor: TransactionProcessor,
        config: BroadcastConfig,
    ) -> Self {
        Self::with_resolver(listener, processor, config, Arc::new(KeccakResolver))
    }

    pub fn with_resolver(
        listener: EventListener,
        processor: TransactionProcessor,
        config: BroadcastConfig,
        resolver: Arc<dyn SignatureResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                listener,
                processor,
                registry: ConnectionRegistry::new(),
                resolver,
                config,
                metrics: BroadcastMetrics::default(),
                contract_subs: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    pub fn listener(&self) -> &EventListener {
        &self.inner.listener
    }

    pub fn processor(&self) -> &TransactionProcessor {
        &self.inner.processor
    }

    /// Wire the listener and processor into the hub and start both.
    pub async fn start(&self) -> Result<(), BroadcastError> {
        if self.inner.cancel.is_cancelled() {
            return Err(BroadcastError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyStarted.into());
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .listener
            .subscribe_all(&EventKind::ALL, Arc::new(EventForwarder { inner: weak.clone() }))
            .await;

        if let Some(min) = self.inner.config.high_value_threshold {
            let id = self
                .inner
                .processor
                .add_filter(TransactionFilter::new().min_value(min))
                .await;
            debug!(filter = %id, %min, "default high-value filter installed");
        }
        self.inner
            .processor
            .on_transaction(Arc::new(AlertForwarder { inner: weak }))
            .await;
        self.inner.processor.start().await?;

        if let Err(e) = self.inner.listener.start().await {
            self.inner.processor.stop();
            return Err(e.into());
        }

        info!("broadcast service started");
        Ok(())
    }

    /// Spawn a connection over `sink`/`stream` and register it.
    pub async fn accept(
        &self,
        sink: FrameSink,
        stream: FrameStream,
    ) -> Result<Arc<SubscriberConnection>, BroadcastError> {
        let observer = Arc::new(ServiceObserver {
            inner: Arc::downgrade(&self.inner),
        });
        let conn = SubscriberConnection::spawn(
            sink,
            stream,
            self.inner.config.connection.clone(),
            observer,
        );
        self.register_connection(conn.clone()).await?;
        Ok(conn)
    }

    /// Add `conn` to the registry and start its liveness probe.
    pub async fn register_connection(
        &self,
        conn: Arc<SubscriberConnection>,
    ) -> Result<(), BroadcastError> {
        if self.inner.cancel.is_cancelled() {
            conn.close();
            return Err(BroadcastError::Stopped);
        }
        self.inner.registry.insert(conn.clone()).await?;
        // `stop` may have drained the registry while we were inserting.
        if self.inner.cancel.is_cancelled() {
            self.inner.unregister(conn.id()).await;
            return Err(BroadcastError::Stopped);
        }
        self.inner.metrics.connection_opened();

        let period = Duration::from_secs(self.inner.config.probe_interval_secs.max(1));
        tokio::spawn(probe(
            Arc::downgrade(&self.inner),
            conn.clone(),
            period,
            self.inner.cancel.child_token(),
        ));
        info!(conn = %conn.id(), "connection registered");
        Ok(())
    }

    /// Remove and close connection `id`. Returns whether it was registered.
    pub async fn unregister_connection(&self, id: Uuid) -> bool {
        self.inner.unregister(id).await
    }

    /// Serialize `event` once and offer it to every interested connection.
    pub async fn broadcast(&self, event: &Event) {
        self.inner.broadcast_event(event).await
    }

    /// Open a log subscription for `contract`. Each signature is either a
    /// topic hash or an event signature; none means every event. A request
    /// for a (contract, topics) pair that is already subscribed reuses the
    /// existing subscription.
    pub async fn subscribe_to_contract(
        &self,
        contract: Address,
        signatures: &[String],
    ) -> Result<SubscriptionId, BroadcastError> {
        self.inner.subscribe_to_contract(contract, signatures).await
    }

    /// Alert on every transaction sent by `address`.
    pub async fn watch_address(&self, address: Address) -> FilterId {
        let id = self
            .inner
            .processor
            .add_filter(TransactionFilter::new().from(address))
            .await;
        info!(%address, filter = %id, "watching address");
        id
    }

    /// Alert on every transaction worth at least `min` wei.
    pub async fn watch_high_value(&self, min: U256) -> FilterId {
        let id = self
            .inner
            .processor
            .add_filter(TransactionFilter::new().min_value(min))
            .await;
        info!(%min, filter = %id, "watching high-value transactions");
        id
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.len().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop the processor, the listener and every connection, then wait for
    /// the transports to be released. Idempotent.
    pub async fn stop(&self) {
        let first = !self.inner.cancel.is_cancelled();
        self.inner.cancel.cancel();
        self.inner.processor.stop();
        self.inner.listener.stop().await;

        let conns = self.inner.registry.drain().await;
        for conn in &conns {
            conn.close();
            self.inner.metrics.connection_closed();
        }
        // A send loop stuck in a write gives up after the write deadline.
        let grace = Duration::from_secs(self.inner.config.connection.write_timeout_secs + 1);
        for conn in &conns {
            if time::timeout(grace, conn.wait_closed()).await.is_err() {
                warn!(conn = %conn.id(), "connection did not close in time");
            }
        }

        if first {
            info!(closed = conns.len(), "broadcast service stopped");
        }
    }
}

impl ServiceInner {
    async fn unregister(&self, id: Uuid) -> bool {
        match self.registry.remove(id).await {
            Some(conn) => {
                conn.close();
                self.metrics.connection_closed();
                info!(conn = %id, "connection unregistered");
                true
            }
            None => false,
        }
    }

    async fn broadcast_event(&self, event: &Event) {
        match WireMessage::from_event(event) {
            Ok(msg) => {
                self.metrics.event_broadcast();
                self.fan_out(&msg).await;
            }
            Err(e) => {
                self.metrics.serialization_error();
                warn!(kind = %event.kind(), block = event.block_number(), error = %e, "dropping event");
            }
        }
    }

    async fn fan_out(&self, msg: &WireMessage) {
        let mut dead = Vec::new();
        for conn in self.registry.snapshot().await {
            if !conn.admits(msg).await {
                self.metrics.message_filtered();
                continue;
            }
            match conn.send(msg.payload().clone()) {
                Ok(()) => self.metrics.message_enqueued(),
                Err(ConnectionError::QueueFull) => {
                    warn!(conn = %conn.id(), kind = %msg.kind(), "slow consumer, disconnecting");
                    self.metrics.slow_consumer_dropped();
                    dead.push(conn.id());
                }
                Err(e) => {
                    debug!(conn = %conn.id(), error = %e, "dropping closed connection");
                    dead.push(conn.id());
                }
            }
        }
        for id in dead {
            self.unregister(id).await;
        }
    }

    async fn subscribe_to_contract(
        &self,
        contract: Address,
        signatures: &[String],
    ) -> Result<SubscriptionId, BroadcastError> {
        if self.cancel.is_cancelled() {
            return Err(BroadcastError::Stopped);
        }
        let mut topics = signatures
            .iter()
            .map(|sig| self.resolver.resolve(sig))
            .collect::<Result<Vec<_>, _>>()?;
        topics.sort_unstable();
        topics.dedup();

        let key = (contract, topics);
        let mut subs = self.contract_subs.lock().await;
        if let Some(id) = subs.get(&key) {
            if self.listener.is_subscribed(id).await {
                debug!(%contract, subscription = %id, "reusing contract subscription");
                return Ok(id.clone());
            }
        }
        let id = self
            .listener
            .subscribe_to_contract_events(contract, key.1.clone())
            .await?;
        subs.insert(key, id.clone());
        Ok(id)
    }
}

/// Pings `conn` every `period` until it closes or the service stops, then
/// makes sure it is no longer registered.
async fn probe(
    inner: Weak<ServiceInner>,
    conn: Arc<SubscriberConnection>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = conn.wait_closed() => break,
            _ = ticker.tick() => {
                if let Err(e) = conn.send_ping() {
                    debug!(conn = %conn.id(), error = %e, "liveness probe failed");
                    break;
                }
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.unregister(conn.id()).await;
    }
}

/// The service's registration on the listener.
struct EventForwarder {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl EventHandler for EventForwarder {
    async fn handle(&self, event: Arc<Event>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.broadcast_event(&event).await;
        }
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}

/// Turns processor matches into `high_value_transaction` messages.
struct AlertForwarder {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl TransactionHandler for AlertForwarder {
    async fn on_transaction(&self, info: Arc<TransactionInfo>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // With no filters every transaction matches; nothing is being watched.
        if inner.processor.filter_count().await == 0 {
            return;
        }
        match WireMessage::high_value(&info) {
            Ok(msg) => {
                inner.metrics.high_value_alert();
                inner.fan_out(&msg).await;
            }
            Err(e) => {
                inner.metrics.serialization_error();
                warn!(tx = %info.hash, error = %e, "dropping alert");
            }
        }
    }

    fn name(&self) -> &str {
        "high-value-alert"
    }
}

/// Routes connection callbacks back into the service.
struct ServiceObserver {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl ConnectionObserver for ServiceObserver {
    async fn on_subscribe(&self, conn_id: Uuid, contract: Address, events: Vec<String>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match inner.subscribe_to_contract(contract, &events).await {
            Ok(id) => info!(conn = %conn_id, %contract, subscription = %id, "client subscribed"),
            Err(e) => warn!(conn = %conn_id, %contract, error = %e, "client subscription failed"),
        }
    }

    async fn on_closed(&self, conn_id: Uuid) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unregister(conn_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainfeed_core::mock::{sample_block, MockFeed};
    use tokio::sync::mpsc;

    fn service(capacity: usize) -> (BroadcastService, Arc<MockFeed>) {
        let feed = Arc::new(MockFeed::new());
        let listener = EventListener::new(feed.clone());
        let processor = TransactionProcessor::new(listener.clone());
        let config = BroadcastConfig {
            connection: ConnectionConfig {
                queue_capacity: capacity,
                ..Default::default()
            },
            ..Default::default()
        };
        (BroadcastService::new(listener, processor, config), feed)
    }

    fn block_event(n: u64) -> Event {
        Event::new_block(Arc::new(sample_block(n, 0))).unwrap()
    }

    async fn attach(
        svc: &BroadcastService,
    ) -> (Arc<SubscriberConnection>, mpsc::Receiver<Arc<str>>) {
        let (conn, rx, _pings) = SubscriberConnection::unstarted(&svc.config().connection);
        svc.register_connection(conn.clone()).await.unwrap();
        (conn, rx)
    }

    fn block_numbers(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<u64> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| {
                let v: serde_json::Value = serde_json::from_str(&m).unwrap();
                v["blockNum"].as_u64().unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn overflow_tears_down_after_capacity() {
        const C: usize = 4;
        let (svc, _feed) = service(C);
        let (conn, mut rx) = attach(&svc).await;

        for n in 1..=(C as u64 + 1) {
            svc.broadcast(&block_event(n)).await;
        }

        assert_eq!(block_numbers(&mut rx), vec![1, 2, 3, 4]);
        assert_eq!(svc.connection_count().await, 0);
        assert!(!conn.is_open());
        assert_eq!(svc.metrics().slow_consumers_dropped, 1);
    }

    #[tokio::test]
    async fn one_full_queue_does_not_affect_others() {
        const M: usize = 5;
        let (svc, _feed) = service(2);
        let mut conns = Vec::new();
        for _ in 0..M {
            conns.push(attach(&svc).await);
        }
        // Saturate the first connection behind the service's back.
        conns[0].0.send("x".into()).unwrap();
        conns[0].0.send("y".into()).unwrap();

        svc.broadcast(&block_event(7)).await;

        assert_eq!(svc.connection_count().await, M - 1);
        for (_, rx) in conns.iter_mut().skip(1) {
            assert_eq!(block_numbers(rx), vec![7]);
        }
        assert!(!conns[0].0.is_open());
    }

    #[tokio::test]
    async fn interest_filters_messages() {
        let (svc, _feed) = service(8);
        let (conn, mut rx) = attach(&svc).await;
        conn.apply_filter(Some(vec!["new_transaction".into()]), None)
            .await;

        svc.broadcast(&block_event(3)).await;
        assert!(block_numbers(&mut rx).is_empty());
        assert_eq!(svc.metrics().messages_filtered, 1);
        assert_eq!(svc.connection_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let (svc, _feed) = service(8);
        let (conn, _rx) = attach(&svc).await;
        assert!(matches!(
            svc.register_connection(conn.clone()).await,
            Err(BroadcastError::DuplicateConnection(_))
        ));
        assert!(svc.unregister_connection(conn.id()).await);
        assert!(!svc.unregister_connection(conn.id()).await);
    }

    #[tokio::test]
    async fn subscribe_to_contract_resolves_signatures() {
        let (svc, feed) = service(8);
        let contract = Address::repeat_byte(0xcc);
        svc.subscribe_to_contract(contract, &["Transfer(address,address,uint256)".to_string()])
            .await
            .unwrap();
        assert_eq!(feed.open_subscriptions(), 1);

        let err = svc
            .subscribe_to_contract(contract, &[" ".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::Resolve(_)));
    }

    #[tokio::test]
    async fn repeated_contract_subscribe_reuses_upstream() {
        let (svc, feed) = service(8);
        let contract = Address::repeat_byte(0xcc);
        let transfer = "Transfer(address,address,uint256)".to_string();
        let approval = "Approval(address,address,uint256)".to_string();

        let first = svc
            .subscribe_to_contract(contract, &[transfer.clone(), approval.clone()])
            .await
            .unwrap();
        let again = svc
            .subscribe_to_contract(contract, &[approval.clone(), transfer.clone()])
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(feed.open_subscriptions(), 1);

        let other = svc.subscribe_to_contract(contract, &[transfer]).await.unwrap();
        assert_ne!(first, other);
        assert_eq!(feed.open_subscriptions(), 2);

        let elsewhere = svc
            .subscribe_to_contract(Address::repeat_byte(0xdd), &[])
            .await
            .unwrap();
        assert_ne!(first, elsewhere);
        assert_eq!(svc.listener().open_subscriptions().await, 3);
        svc.stop().await;
    }

    #[tokio::test]
    async fn start_installs_default_filter_and_stop_is_final() {
        let (svc, feed) = service(8);
        svc.start().await.unwrap();
        assert_eq!(svc.processor().filter_count().await, 1);
        assert_eq!(feed.open_subscriptions(), 1);
        assert!(svc.start().await.is_err());

        svc.stop().await;
        svc.stop().await;
        assert_eq!(feed.open_subscriptions(), 0);
        assert!(matches!(svc.start().await, Err(BroadcastError::Stopped)));

        let (conn, _rx, _pings) = SubscriberConnection::unstarted(&svc.config().connection);
        assert!(matches!(
            svc.register_connection(conn.clone()).await,
            Err(BroadcastError::Stopped)
        ));
        assert!(!conn.is_open());
    }
}
