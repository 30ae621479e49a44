//! WebSocket subscription management.
//!
//! Callers hold a stable local [`SubscriptionId`]. The node's own id for the
//! subscription changes every time the socket reconnects and the
//! subscription is re-established, so the manager keeps the mapping from
//! local ids to the current server ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chainfeed_core::SubscriptionId;
use serde_json::Value;
use tokio::sync::mpsc;

/// Metadata for a single subscription.
struct SubscriptionEntry {
    /// The subscription type (e.g. `"newHeads"`, `"logs"`).
    kind: String,
    /// Parameters for re-subscribing (e.g. filter params).
    params: Vec<Value>,
    /// Id assigned by the node on the current connection.
    server_id: Option<String>,
    /// Channel to forward incoming notifications to the caller.
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct Entries {
    by_local: HashMap<SubscriptionId, SubscriptionEntry>,
    by_server: HashMap<String, SubscriptionId>,
}

/// Manages active WebSocket subscriptions and supports re-subscription.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<Entries>>,
    next_local: Arc<AtomicU64>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscription the node acknowledged with `server_id`.
    pub fn register(
        &self,
        server_id: String,
        kind: String,
        params: Vec<Value>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Value>) {
        let local = SubscriptionId(format!(
            "sub-{}",
            self.next_local.fetch_add(1, Ordering::Relaxed) + 1
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut entries = self.entries();
        entries.by_server.insert(server_id.clone(), local.clone());
        entries.by_local.insert(
            local.clone(),
            SubscriptionEntry {
                kind,
                params,
                server_id: Some(server_id),
                sender: tx,
            },
        );
        (local, rx)
    }

    /// Forward an incoming notification to the subscription the node
    /// knows as `server_id`.
    pub fn dispatch(&self, server_id: &str, message: Value) {
        let entries = self.entries();
        let Some(local) = entries.by_server.get(server_id) else {
            return;
        };
        if let Some(entry) = entries.by_local.get(local) {
            let _ = entry.sender.send(message);
        }
    }

    /// Remove a subscription, returning the server id to cancel, if any.
    pub fn remove(&self, local: &SubscriptionId) -> Option<Option<String>> {
        let mut entries = self.entries();
        let entry = entries.by_local.remove(local)?;
        if let Some(server_id) = &entry.server_id {
            entries.by_server.remove(server_id);
        }
        Some(entry.server_id)
    }

    /// Forget every server id. Called when the socket drops.
    pub fn unbind_all(&self) {
        let mut entries = self.entries();
        entries.by_server.clear();
        for entry in entries.by_local.values_mut() {
            entry.server_id = None;
        }
    }

    /// Attach a new server id after re-subscribing.
    pub fn rebind(&self, local: &SubscriptionId, server_id: String) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.by_local.get_mut(local) else {
            return false;
        };
        entry.server_id = Some(server_id.clone());
        entries.by_server.insert(server_id, local.clone());
        true
    }

    /// (local id, kind, params) for every subscription. Used to
    /// re-subscribe after reconnect.
    pub fn active_subscriptions(&self) -> Vec<(SubscriptionId, String, Vec<Value>)> {
        self.entries()
            .by_local
            .iter()
            .map(|(id, e)| (id.clone(), e.kind.clone(), e.params.clone()))
            .collect()
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.entries().by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
