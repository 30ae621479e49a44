//! In-process fan-out counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BroadcastMetrics {
    events_broadcast: AtomicU64,
    high_value_alerts: AtomicU64,
    messages_enqueued: AtomicU64,
    messages_filtered: AtomicU64,
    serialization_errors: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    slow_consumers_dropped: AtomicU64,
}

/// Point-in-time copy of [`BroadcastMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_broadcast: u64,
    pub high_value_alerts: u64,
    pub messages_enqueued: u64,
    pub messages_filtered: u64,
    pub serialization_errors: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub slow_consumers_dropped: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BroadcastMetrics {
    pub(crate) fn event_broadcast(&self) {
        bump(&self.events_broadcast)
    }
    pub(crate) fn high_value_alert(&self) {
        bump(&self.high_value_alerts)
    }
    pub(crate) fn message_enqueued(&self) {
        bump(&self.messages_enqueued)
    }
    pub(crate) fn message_filtered(&self) {
        bump(&self.messages_filtered)
    }
    pub(crate) fn serialization_error(&self) {
        bump(&self.serialization_errors)
    }
    pub(crate) fn connection_opened(&self) {
        bump(&self.connections_opened)
    }
    pub(crate) fn connection_closed(&self) {
        bump(&self.connections_closed)
    }
    pub(crate) fn slow_consumer_dropped(&self) {
        bump(&self.slow_consumers_dropped)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_broadcast: get(&self.events_broadcast),
            high_value_alerts: get(&self.high_value_alerts),
            messages_enqueued: get(&self.messages_enqueued),
            messages_filtered: get(&self.messages_filtered),
            serialization_errors: get(&self.serialization_errors),
            connections_opened: get(&self.connections_opened),
            connections_closed: get(&self.connections_closed),
            slow_consumers_dropped: get(&self.slow_consumers_dropped),
        }
    }
}
