//! One subscriber's duplex connection.
//!
//! Each connection runs three tasks:
//!
//! - the **send loop**, the only writer to the transport. It batches
//!   everything currently queued into one text frame (messages joined by
//!   `\n`), emits a keepalive ping on its own timer and on request, and
//!   bounds every write with a deadline;
//! - the **receive loop**, which handles inbound control frames and closes
//!   the connection if the peer stays silent past the read deadline;
//! - a **supervisor**, which marks the connection `Closed` once both loops
//!   have exited and notifies the observer.
//!
//! State only moves forward: `Open → Closing → Closed`.

use alloy_primitives::Address;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::message::{ClientMessage, Interest, MessageKind, WireMessage};

/// A transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ConnectionError>> + Send>>;

fn default_queue_capacity() -> usize {
    256
}
fn default_ping_interval() -> u64 {
    45
}
fn default_write_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    60
}
fn default_max_frame_bytes() -> usize {
    512 * 1024
}

/// Per-connection limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound queue capacity; overflowing it closes the connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Keepalive ping period of the send loop, in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Deadline for a single write, in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Silence after which the peer is considered gone, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Largest inbound text frame accepted.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval(),
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ConnectionConfig {
    fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
    fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Receives what a connection reports upward.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// The peer asked for the events of `contract`.
    async fn on_subscribe(&self, conn_id: Uuid, contract: Address, events: Vec<String>);

    /// Both loops have exited.
    async fn on_closed(&self, conn_id: Uuid);
}

/// The hub's handle on one subscriber.
pub struct SubscriberConnection {
    id: Uuid,
    queue: mpsc::Sender<Arc<str>>,
    pings: mpsc::Sender<()>,
    interest: RwLock<Interest>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl SubscriberConnection {
    /// Start the loops for a new connection over `sink`/`stream`.
    pub fn spawn(
        sink: FrameSink,
        stream: FrameStream,
        config: ConnectionConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<Self> {
        let (conn, queue_rx, ping_rx) = Self::unstarted(&config);

        let send = tokio::spawn(send_loop(
            conn.id,
            sink,
            queue_rx,
            ping_rx,
            conn.cancel.clone(),
            config.clone(),
        ));
        let recv = tokio::spawn(recv_loop(conn.clone(), stream, observer.clone(), config));

        let supervised = conn.clone();
        tokio::spawn(async move {
            let _ = tokio::join!(send, recv);
            supervised.state.send_replace(ConnectionState::Closed);
            debug!(conn = %supervised.id, "connection closed");
            observer.on_closed(supervised.id).await;
        });

        info!(conn = %conn.id, "subscriber connected");
        conn
    }

    /// A connection with no loops attached. The receivers stand in for the
    /// send loop.
    pub(crate) fn unstarted(
        config: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>, mpsc::Receiver<()>) {
        let (queue, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (pings, ping_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(ConnectionState::Open);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            queue,
            pings,
            interest: RwLock::new(Interest::default()),
            state,
            cancel: CancellationToken::new(),
        });
        (conn, queue_rx, ping_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Offer `message` to the outbound queue without waiting.
    pub fn send(&self, message: Arc<str>) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.queue.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Ask the send loop for a ping frame.
    pub fn send_ping(&self) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        match self.pings.try_send(()) {
            // A ping is already pending; that one covers this request.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Start closing. Idempotent.
    pub fn close(&self) {
        self.begin_closing();
        self.cancel.cancel();
    }

    fn begin_closing(&self) {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Open {
                *s = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Resolve once both loops have exited.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub async fn interest(&self) -> Interest {
        self.interest.read().await.clone()
    }

    /// Whether this subscriber's interest set admits `msg`.
    pub async fn admits(&self, msg: &WireMessage) -> bool {
        self.interest.read().await.admits(msg)
    }

    /// Replace the parts of the interest set that were provided.
    pub async fn apply_filter(&self, event_types: Option<Vec<String>>, contracts: Option<Vec<Address>>) {
        let mut interest = self.interest.write().await;
        if let Some(types) = event_types {
            interest.kinds = types
                .iter()
                .filter_map(|t| match t.parse::<MessageKind>() {
                    Ok(kind) => Some(kind),
                    Err(e) => {
                        debug!(conn = %self.id, "ignoring filter entry: {e}");
                        None
                    }
                })
                .collect();
        }
        if let Some(contracts) = contracts {
            interest.contracts = contracts.into_iter().collect();
        }
        debug!(conn = %self.id, kinds = interest.kinds.len(), contracts = interest.contracts.len(), "interest updated");
    }

    /// Handle one inbound text frame. Only invalid JSON is an error.
    async fn handle_text(
        &self,
        text: &str,
        observer: &dyn ConnectionObserver,
    ) -> Result<(), ConnectionError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConnectionError::Malformed(e.to_string()))?;

        match serde_json::from_value::<ClientMessage>(value) {
            Ok(ClientMessage::Subscribe { contract, events }) => {
                observer.on_subscribe(self.id, contract, events).await
            }
            Ok(ClientMessage::Filter {
                event_types,
                contracts,
            }) => self.apply_filter(event_types, contracts).await,
            Ok(ClientMessage::Unknown) => debug!(conn = %self.id, "ignoring unknown message type"),
            Err(e) => warn!(conn = %self.id, error = %e, "ignoring invalid control message"),
        }
        Ok(())
    }
}

/// Join everything queued behind `first` into one newline-separated frame.
fn drain_batch(first: Arc<str>, queue: &mut mpsc::Receiver<Arc<str>>) -> String {
    let mut text = String::from(&*first);
    while let Ok(next) = queue.try_recv() {
        text.push('\n');
        text.push_str(&next);
    }
    text
}

async fn send_loop(
    id: Uuid,
    mut sink: FrameSink,
    mut queue: mpsc::Receiver<Arc<str>>,
    mut pings: mpsc::Receiver<()>,
    cancel: CancellationToken,
    config: ConnectionConfig,
) {
    let period = config.ping_interval();
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    // Cleared when the transport can no longer be trusted with a close frame.
    let mut healthy = true;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(first) => Frame::Text(drain_batch(first, &mut queue)),
                None => break,
            },
            Some(()) = pings.recv() => Frame::Ping(Vec::new()),
            _ = keepalive.tick() => Frame::Ping(Vec::new()),
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                healthy = false;
                break;
            }
            written = time::timeout(config.write_timeout(), sink.send(frame)) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conn = %id, error = %e, "write failed");
                healthy = false;
                break;
            }
            Err(_) => {
                warn!(conn = %id, "write deadline exceeded");
                healthy = false;
                break;
            }
        }
    }

    cancel.cancel();
    if healthy {
        let _ = time::timeout(config.write_timeout(), async {
            let _ = sink.send(Frame::Close).await;
            let _ = sink.close().await;
        })
        .await;
    }
    debug!(conn = %id, "send loop exited");
}

async fn recv_loop(
    conn: Arc<SubscriberConnection>,
    mut stream: FrameStream,
    observer: Arc<dyn ConnectionObserver>,
    config: ConnectionConfig,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            next = time::timeout(config.read_timeout(), stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                info!(conn = %conn.id, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn = %conn.id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Text(text) => {
                if text.len() > config.max_frame_bytes {
                    warn!(conn = %conn.id, size = text.len(), "inbound frame too large");
                    break;
                }
                if let Err(e) = conn.handle_text(&text, observer.as_ref()).await {
                    warn!(conn = %conn.id, error = %e, "closing connection");
                    break;
                }
            }
            // Any frame refreshes the read deadline.
            Frame::Ping(_) | Frame::Pong(_) => {}
            Frame::Close => break,
        }
    }

    conn.close();
    debug!(conn = %conn.id, "receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        subscribed: Mutex<Vec<(Address, Vec<String>)>>,
        closed: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ConnectionObserver for Recorder {
        async fn on_subscribe(&self, _conn_id: Uuid, contract: Address, events: Vec<String>) {
            self.subscribed.lock().unwrap().push((contract, events));
        }
        async fn on_closed(&self, conn_id: Uuid) {
            self.closed.lock().unwrap().push(conn_id);
        }
    }

    struct Peer {
        /// Frames written by the connection.
        outbound: fmpsc::UnboundedReceiver<Frame>,
        /// Frames the peer sends to the connection.
        inbound: fmpsc::UnboundedSender<Result<Frame, ConnectionError>>,
    }

    fn pipe() -> (FrameSink, FrameStream, Peer) {
        let (out_tx, out_rx) = fmpsc::unbounded::<Frame>();
        let (in_tx, in_rx) = fmpsc::unbounded();
        let sink: FrameSink =
            Box::pin(out_tx.sink_map_err(|e| ConnectionError::Transport(e.to_string())));
        (
            sink,
            Box::pin(in_rx),
            Peer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    async fn next_text(peer: &mut Peer) -> String {
        loop {
            let frame = time::timeout(Duration::from_secs(2), peer.outbound.next())
                .await
                .unwrap()
                .unwrap();
            if let Frame::Text(t) = frame {
                return t;
            }
        }
    }

    fn open(config: ConnectionConfig) -> (Arc<SubscriberConnection>, Peer, Arc<Recorder>) {
        let (sink, stream, peer) = pipe();
        let recorder = Arc::new(Recorder::default());
        let conn = SubscriberConnection::spawn(sink, stream, config, recorder.clone());
        (conn, peer, recorder)
    }

    #[test]
    fn overflow_rejects_after_capacity() {
        let config = ConnectionConfig {
            queue_capacity: 3,
            ..Default::default()
        };
        let (conn, mut rx, _pings) = SubscriberConnection::unstarted(&config);
        for i in 0..3 {
            conn.send(format!("m{i}").into()).unwrap();
        }
        assert!(matches!(conn.send("m3".into()), Err(ConnectionError::QueueFull)));

        let queued: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.to_string())
            .collect();
        assert_eq!(queued, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn send_fails_once_closing() {
        let (conn, _rx, _pings) = SubscriberConnection::unstarted(&ConnectionConfig::default());
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(matches!(conn.send("x".into()), Err(ConnectionError::Closed)));
        assert!(matches!(conn.send_ping(), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn queued_messages_are_batched_with_newlines() {
        let (conn, mut rx, _pings) = SubscriberConnection::unstarted(&ConnectionConfig::default());
        conn.send("a".into()).unwrap();
        conn.send("b".into()).unwrap();
        conn.send("c".into()).unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(drain_batch(first, &mut rx), "a\nb\nc");
    }

    #[tokio::test]
    async fn delivers_messages_and_pings() {
        let (conn, mut peer, _rec) = open(ConnectionConfig::default());
        conn.send(r#"{"type":"new_block"}"#.into()).unwrap();
        assert_eq!(next_text(&mut peer).await, r#"{"type":"new_block"}"#);

        conn.send_ping().unwrap();
        let frame = time::timeout(Duration::from_secs(2), peer.outbound.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::Ping(Vec::new()));
        conn.close();
        conn.wait_closed().await;
    }

    #[tokio::test]
    async fn control_frames_update_interest_and_forward_subscribe() {
        let (conn, peer, rec) = open(ConnectionConfig::default());
        let contract = Address::repeat_byte(0xcc);

        peer.inbound
            .unbounded_send(Ok(Frame::Text(format!(
                r#"{{"type":"filter","eventTypes":["contract_event","bogus"],"contracts":["{contract}"]}}"#
            ))))
            .unwrap();
        peer.inbound
            .unbounded_send(Ok(Frame::Text(format!(
                r#"{{"type":"subscribe","contract":"{contract}","events":["Transfer(address,address,uint256)"]}}"#
            ))))
            .unwrap();
        peer.inbound
            .unbounded_send(Ok(Frame::Text(r#"{"type":"hello"}"#.into())))
            .unwrap();

        time::timeout(Duration::from_secs(2), async {
            while rec.subscribed.lock().unwrap().is_empty() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let interest = conn.interest().await;
        assert_eq!(interest.kinds.len(), 1);
        assert!(interest.kinds.contains(&MessageKind::ContractEvent));
        assert!(interest.contracts.contains(&contract));
        assert_eq!(
            rec.subscribed.lock().unwrap()[0],
            (contract, vec!["Transfer(address,address,uint256)".to_string()])
        );
        assert!(conn.is_open());
        conn.close();
    }

    #[tokio::test]
    async fn invalid_json_tears_down() {
        let (conn, peer, rec) = open(ConnectionConfig::default());
        peer.inbound
            .unbounded_send(Ok(Frame::Text("{not json".into())))
            .unwrap();

        time::timeout(Duration::from_secs(2), conn.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        time::timeout(Duration::from_secs(2), async {
            while rec.closed.lock().unwrap().is_empty() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(rec.closed.lock().unwrap()[0], conn.id());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_read_deadline() {
        let (conn, _peer, _rec) = open(ConnectionConfig {
            read_timeout_secs: 60,
            ..Default::default()
        });
        time::timeout(Duration::from_secs(120), conn.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
