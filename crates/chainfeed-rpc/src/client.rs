//! WebSocket JSON-RPC client with auto-reconnect and subscription management.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use chainfeed_core::{
    Block, BlockHeader, FeedError, FeedStream, FeedSubscription, Log, LogFilter, SubscriptionId,
    UpstreamFeed,
};

use crate::error::TransportError;
use crate::parse;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionNotification};
use crate::subscriptions::SubscriptionManager;

type Subscribed = (SubscriptionId, mpsc::UnboundedReceiver<Value>);

fn default_reconnect_initial() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for the WebSocket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClientConfig {
    /// Reconnect backoff starting duration.
    #[serde(default = "default_reconnect_initial", with = "duration_ms")]
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    #[serde(default = "default_reconnect_max", with = "duration_ms")]
    pub reconnect_max: Duration,
    /// How long a request may wait for its response.
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: default_reconnect_initial(),
            reconnect_max: default_reconnect_max(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Durations as integer milliseconds in config files.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Call {
        req: JsonRpcRequest,
        tx: oneshot::Sender<Result<JsonRpcResponse, TransportError>>,
    },
    Subscribe {
        req: JsonRpcRequest,
        kind: String,
        params: Vec<Value>,
        tx: oneshot::Sender<Result<Subscribed, TransportError>>,
    },
    /// The caller stopped waiting for request `id`.
    Cancel(u64),
    Close,
}

/// A request awaiting its response on the current connection.
enum Pending {
    Call(oneshot::Sender<Result<JsonRpcResponse, TransportError>>),
    Subscribe {
        kind: String,
        params: Vec<Value>,
        tx: oneshot::Sender<Result<Subscribed, TransportError>>,
    },
    Resubscribe(SubscriptionId),
    /// A subscribe whose caller gave up. If the node still accepts it, the
    /// subscription is cancelled again.
    Abandoned,
}

impl Pending {
    fn fail(self, reason: &str) {
        match self {
            Pending::Call(tx) => {
                let _ = tx.send(Err(TransportError::WebSocket(reason.to_string())));
            }
            Pending::Subscribe { tx, .. } => {
                let _ = tx.send(Err(TransportError::WebSocket(reason.to_string())));
            }
            Pending::Resubscribe(_) | Pending::Abandoned => {}
        }
    }
}

/// WebSocket JSON-RPC client.
///
/// Maintains a background task that owns the WebSocket connection and
/// handles reconnect + re-subscribe logic transparently. Subscription
/// streams survive reconnects.
pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: SubscriptionManager,
    next_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    request_timeout: Duration,
}

impl WsRpcClient {
    /// Start the background task for `url`. The socket is opened (and
    /// reopened) in the background. Requests queue while a connection
    /// attempt is in flight and fail fast during reconnect backoff.
    pub fn connect(url: impl Into<String>, config: WsClientConfig) -> Self {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let subscriptions = SubscriptionManager::new();
        let next_id = Arc::new(AtomicU64::new(1));
        let connected = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let request_timeout = config.request_timeout;

        tokio::spawn(ws_task(
            url.clone(),
            cmd_rx,
            subscriptions.clone(),
            config,
            next_id.clone(),
            connected.clone(),
            in_flight.clone(),
        ));

        Self {
            url,
            cmd_tx,
            subscriptions,
            next_id,
            connected,
            in_flight,
            request_timeout,
        }
    }

    /// Returns `true` while the socket is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions held by this client.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Requests sent on the current connection that are still awaiting a
    /// reply.
    pub fn pending_requests(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn request(&self, method: &str, params: Vec<Value>) -> (u64, JsonRpcRequest) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        (id, JsonRpcRequest::new(id, method, params))
    }

    async fn await_reply<T>(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                let _ = self.cmd_tx.send(WsCommand::Cancel(id));
                Err(TransportError::Timeout {
                    ms: self.request_timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(res)) => res,
        }
    }

    /// Call `method` and return the raw result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        let (id, req) = self.request(method, params);
        self.cmd_tx
            .send(WsCommand::Call { req, tx })
            .map_err(|_| TransportError::Closed)?;
        self.await_reply(id, rx)
            .await?
            .into_result()
            .map_err(TransportError::Rpc)
    }

    /// Subscribe to a WebSocket event stream.
    ///
    /// `kind` is the subscription type (e.g. `"newHeads"`, `"logs"`).
    pub async fn subscribe(&self, kind: &str, params: Vec<Value>) -> Result<Subscribed, TransportError> {
        let (tx, rx) = oneshot::channel();
        let (id, req) = self.request(
            "eth_subscribe",
            std::iter::once(Value::String(kind.to_string()))
                .chain(params.clone())
                .collect(),
        );
        self.cmd_tx
            .send(WsCommand::Subscribe {
                req,
                kind: kind.to_string(),
                params,
                tx,
            })
            .map_err(|_| TransportError::Closed)?;
        self.await_reply(id, rx).await
    }

    /// Cancel a subscription. Its notification channel closes immediately.
    pub async fn unsubscribe_local(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        match self.subscriptions.remove(id) {
            None => Err(TransportError::invalid("subscription", id.to_string())),
            // Not bound on the current connection; nothing to cancel server-side.
            Some(None) => Ok(()),
            Some(Some(server_id)) => {
                self.call("eth_unsubscribe", vec![Value::String(server_id)])
                    .await?;
                Ok(())
            }
        }
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

/// Turn a subscription channel into a typed feed stream.
fn typed_stream<T, F>(rx: mpsc::UnboundedReceiver<Value>, parse: F) -> FeedStream<T>
where
    T: Send + 'static,
    F: Fn(Value) -> Result<T, TransportError> + Send + 'static,
{
    let raw = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
    Box::pin(raw.map(move |v| parse(v).map_err(FeedError::from)))
}

#[async_trait]
impl UpstreamFeed for WsRpcClient {
    fn name(&self) -> &str {
        &self.url
    }

    async fn subscribe_new_heads(&self) -> Result<FeedSubscription<BlockHeader>, FeedError> {
        let (id, rx) = self
            .subscribe("newHeads", vec![])
            .await
            .map_err(|e| FeedError::Subscribe {
                kind: "newHeads".into(),
                reason: e.to_string(),
            })?;
        Ok(FeedSubscription {
            id,
            stream: typed_stream(rx, parse::header_from_json),
        })
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Block, FeedError> {
        let result = self
            .call("eth_getBlockByHash", vec![json!(hash), Value::Bool(true)])
            .await
            .map_err(|e| FeedError::Fetch {
                hash,
                reason: e.to_string(),
            })?;
        if result.is_null() {
            return Err(FeedError::BlockNotFound { hash });
        }
        parse::block_from_json(result).map_err(|e| FeedError::Fetch {
            hash,
            reason: e.to_string(),
        })
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<FeedSubscription<Log>, FeedError> {
        let (id, rx) = self
            .subscribe("logs", vec![parse::log_filter_params(&filter)])
            .await
            .map_err(|e| FeedError::Subscribe {
                kind: "logs".into(),
                reason: e.to_string(),
            })?;
        Ok(FeedSubscription {
            id,
            stream: typed_stream(rx, parse::log_from_json),
        })
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), FeedError> {
        self.unsubscribe_local(id)
            .await
            .map_err(|e| FeedError::Unsubscribe {
                id: id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: SubscriptionManager,
    config: WsClientConfig,
    next_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
) {
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let mut backoff = config.reconnect_initial;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        let (mut sink, mut stream) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream.split(),
            Err(e) => {
                tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
                if !wait_backoff(backoff, &mut cmd_rx).await {
                    return;
                }
                backoff = (backoff * 2).min(config.reconnect_max);
                continue;
            }
        };
        backoff = config.reconnect_initial;
        connected.store(true, Ordering::Relaxed);

        // Re-subscribe any active subscriptions
        for (local, kind, params) in subscriptions.active_subscriptions() {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let req = JsonRpcRequest::new(
                id,
                "eth_subscribe",
                std::iter::once(Value::String(kind)).chain(params).collect(),
            );
            if let Ok(msg) = serde_json::to_string(&req) {
                pending.insert(id, Pending::Resubscribe(local));
                let _ = sink.send(Message::Text(msg)).await;
            }
        }

        // Main dispatch loop
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let (req, entry) = match cmd {
                        None | Some(WsCommand::Close) => {
                            let _ = sink.close().await;
                            connected.store(false, Ordering::Relaxed);
                            for (_, p) in pending.drain() {
                                p.fail("client closed");
                            }
                            return;
                        }
                        Some(WsCommand::Call { req, tx }) => (req, Pending::Call(tx)),
                        Some(WsCommand::Subscribe { req, kind, params, tx }) => {
                            (req, Pending::Subscribe { kind, params, tx })
                        }
                        Some(WsCommand::Cancel(id)) => {
                            // A late subscribe ack must still be undone.
                            if let Some(Pending::Subscribe { .. }) = pending.remove(&id) {
                                pending.insert(id, Pending::Abandoned);
                            }
                            in_flight.store(pending.len(), Ordering::Relaxed);
                            continue;
                        }
                    };
                    let Some(id) = req.numeric_id() else { continue };
                    match serde_json::to_string(&req) {
                        Ok(msg) => {
                            pending.insert(id, entry);
                            in_flight.store(pending.len(), Ordering::Relaxed);
                            if sink.send(Message::Text(msg)).await.is_err() {
                                // Connection dropped; reconnect
                                break;
                            }
                        }
                        Err(e) => entry.fail(&e.to_string()),
                    }
                }
                msg = stream.next() => {
                    match msg {
                        None => break,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WS receive error");
                            break;
                        }
                        Some(Ok(Message::Text(text))) => {
                            let orphan = handle_message(text.as_str(), &mut pending, &subscriptions);
                            in_flight.store(pending.len(), Ordering::Relaxed);
                            if let Some(server_id) = orphan {
                                let req = JsonRpcRequest::new(
                                    next_id.fetch_add(1, Ordering::Relaxed),
                                    "eth_unsubscribe",
                                    vec![Value::String(server_id.clone())],
                                );
                                tracing::debug!(server_id = %server_id, "cancelling abandoned subscription");
                                if let Ok(msg) = serde_json::to_string(&req) {
                                    if sink.send(Message::Text(msg)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => break,
                        _ => {}
                    }
                }
            }
        }

        connected.store(false, Ordering::Relaxed);
        subscriptions.unbind_all();
        for (_, p) in pending.drain() {
            p.fail("connection lost");
        }
        in_flight.store(0, Ordering::Relaxed);

        tracing::warn!(url = %url, "WS disconnected, reconnecting in {backoff:?}");
        if !wait_backoff(backoff, &mut cmd_rx).await {
            return;
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

/// Sleep for `backoff`, failing any request made meanwhile. Returns `false`
/// if the client was closed.
async fn wait_backoff(backoff: Duration, cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>) -> bool {
    let sleep = time::sleep(backoff);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Close) => return false,
                Some(WsCommand::Cancel(_)) => {}
                Some(WsCommand::Call { tx, .. }) => Pending::Call(tx).fail("not connected"),
                Some(WsCommand::Subscribe { kind, params, tx, .. }) => {
                    Pending::Subscribe { kind, params, tx }.fail("not connected")
                }
            },
        }
    }
}

/// Route one inbound text frame. Returns the server id of a subscription
/// the node accepted after its caller gave up; it must be cancelled.
fn handle_message(
    text: &str,
    pending: &mut HashMap<u64, Pending>,
    subscriptions: &SubscriptionManager,
) -> Option<String> {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return None;
    };

    // Subscription notification
    if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
        match serde_json::from_value::<SubscriptionNotification>(val) {
            Ok(n) => subscriptions.dispatch(&n.params.subscription, n.params.result),
            Err(e) => tracing::debug!(error = %e, "malformed subscription notification"),
        }
        return None;
    }

    // Regular JSON-RPC response
    let Ok(resp) = serde_json::from_value::<JsonRpcResponse>(val) else {
        return None;
    };
    let RpcId::Number(id) = resp.id else {
        return None;
    };
    let entry = pending.remove(&id)?;

    match entry {
        Pending::Call(tx) => {
            let _ = tx.send(Ok(resp));
        }
        Pending::Subscribe { kind, params, tx } => match resp.into_result() {
            Ok(Value::String(server_id)) => {
                if tx.is_closed() {
                    return Some(server_id);
                }
                let (local, rx) = subscriptions.register(server_id.clone(), kind, params);
                if tx.send(Ok((local.clone(), rx))).is_err() {
                    subscriptions.remove(&local);
                    return Some(server_id);
                }
            }
            Ok(other) => {
                let _ = tx.send(Err(TransportError::invalid("subscription id", other.to_string())));
            }
            Err(e) => {
                let _ = tx.send(Err(TransportError::Rpc(e)));
            }
        },
        Pending::Abandoned => {
            if let Ok(Value::String(server_id)) = resp.into_result() {
                return Some(server_id);
            }
        }
        Pending::Resubscribe(local) => match resp.into_result() {
            Ok(Value::String(server_id)) => {
                if subscriptions.rebind(&local, server_id) {
                    tracing::info!(subscription = %local, "re-subscribed after reconnect");
                }
            }
            Ok(other) => tracing::warn!(subscription = %local, result = %other, "bad re-subscribe reply"),
            Err(e) => tracing::warn!(subscription = %local, error = %e, "re-subscribe failed"),
        },
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_reply_registers_before_next_notification() {
        let subs = SubscriptionManager::new();
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(
            3,
            Pending::Subscribe {
                kind: "newHeads".into(),
                params: vec![],
                tx,
            },
        );

        handle_message(r#"{"jsonrpc":"2.0","id":3,"result":"0xfeed"}"#, &mut pending, &subs);
        handle_message(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xfeed","result":{"n":1}}}"#,
            &mut pending,
            &subs,
        );

        let (_id, mut notes) = rx.try_recv().unwrap().unwrap();
        assert_eq!(notes.try_recv().unwrap()["n"], 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn rpc_error_fails_subscribe() {
        let subs = SubscriptionManager::new();
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(
            1,
            Pending::Subscribe {
                kind: "logs".into(),
                params: vec![],
                tx,
            },
        );
        handle_message(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"notifications not supported"}}"#,
            &mut pending,
            &subs,
        );
        assert!(matches!(rx.try_recv().unwrap(), Err(TransportError::Rpc(_))));
        assert!(subs.is_empty());
    }

    #[test]
    fn late_subscribe_reply_after_caller_left_is_cancelled() {
        let subs = SubscriptionManager::new();
        let mut pending = HashMap::new();
        let (tx, rx) = oneshot::channel();
        pending.insert(
            5,
            Pending::Subscribe {
                kind: "logs".into(),
                params: vec![],
                tx,
            },
        );
        drop(rx);

        let orphan = handle_message(r#"{"jsonrpc":"2.0","id":5,"result":"0xlate"}"#, &mut pending, &subs);
        assert_eq!(orphan.as_deref(), Some("0xlate"));
        assert!(subs.is_empty());
        assert!(subs.active_subscriptions().is_empty());
    }

    #[test]
    fn abandoned_subscribe_is_cancelled_once_acknowledged() {
        let subs = SubscriptionManager::new();
        let mut pending = HashMap::new();
        pending.insert(9, Pending::Abandoned);

        let orphan = handle_message(r#"{"jsonrpc":"2.0","id":9,"result":"0x77"}"#, &mut pending, &subs);
        assert_eq!(orphan.as_deref(), Some("0x77"));
        assert!(pending.is_empty());
        assert!(subs.is_empty());
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let cfg: WsClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.reconnect_initial, Duration::from_millis(500));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
    }
}
