//! `TransactionProcessor`: enriches and filters `NewTransaction` events.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::{Delivery, HandlerWorker};
use crate::error::ListenerError;
use crate::event::{Event, EventKind};
use crate::filter::{FilterId, FilterSet, TransactionFilter};
use crate::handler::{EventHandler, TransactionHandler};
use crate::listener::EventListener;
use crate::transaction::{ReportedSender, SenderRecovery, TransactionInfo};

/// Builds a [`TransactionInfo`] for every transaction event, runs it
/// through the filter set and hands matches to the registered handlers.
#[derive(Clone)]
pub struct TransactionProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    listener: EventListener,
    filters: RwLock<FilterSet>,
    handlers: RwLock<Vec<Arc<HandlerWorker<TransactionInfo>>>>,
    recovery: Arc<dyn SenderRecovery>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl TransactionProcessor {
    pub fn new(listener: EventListener) -> Self {
        Self::with_recovery(listener, Arc::new(ReportedSender))
    }

    /// Use a custom sender-recovery strategy.
    pub fn with_recovery(listener: EventListener, recovery: Arc<dyn SenderRecovery>) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                listener,
                filters: RwLock::new(FilterSet::new()),
                handlers: RwLock::new(Vec::new()),
                recovery,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Install `filter` as the only active filter.
    pub async fn with_filter(&self, filter: TransactionFilter) -> FilterId {
        self.inner.filters.write().await.replace(filter)
    }

    /// Add `filter` alongside the existing ones.
    pub async fn add_filter(&self, filter: TransactionFilter) -> FilterId {
        let id = self.inner.filters.write().await.add(filter);
        debug!(filter = %id, "transaction filter added");
        id
    }

    pub async fn remove_filter(&self, id: FilterId) -> bool {
        self.inner.filters.write().await.remove(id)
    }

    pub async fn clear_filters(&self) {
        self.inner.filters.write().await.clear();
    }

    pub async fn filter_count(&self) -> usize {
        self.inner.filters.read().await.len()
    }

    /// Register `handler` for every matching transaction.
    pub async fn on_transaction(&self, handler: Arc<dyn TransactionHandler>) {
        let worker = HandlerWorker::spawn(
            handler,
            self.inner.listener.config().handler_queue_capacity,
            self.inner.cancel.child_token(),
        );
        debug!(handler = worker.name(), "transaction handler registered");
        self.inner.handlers.write().await.push(Arc::new(worker));
    }

    /// Begin consuming `NewTransaction` events. Idempotent while running.
    pub async fn start(&self) -> Result<(), ListenerError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ListenerError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handler = Arc::new(ProcessorHandler {
            inner: self.inner.clone(),
        });
        self.inner
            .listener
            .subscribe(EventKind::NewTransaction, handler)
            .await;
        info!("transaction processor started");
        Ok(())
    }

    /// Stop processing. Does not wait for handlers that are already
    /// running. Idempotent.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            self.inner.cancel.cancel();
            info!("transaction processor stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Matches dropped because a transaction handler's queue was full.
    pub async fn dropped_matches(&self) -> u64 {
        self.inner
            .handlers
            .read()
            .await
            .iter()
            .map(|w| w.dropped())
            .sum()
    }
}

/// The processor's registration on the listener.
struct ProcessorHandler {
    inner: Arc<ProcessorInner>,
}

#[async_trait]
impl EventHandler for ProcessorHandler {
    async fn handle(&self, event: Arc<Event>) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let Some(tx) = event.transaction() else {
            return;
        };

        let from = self.inner.recovery.recover(tx);
        let info = TransactionInfo::new(event.block_hash(), event.block_number(), tx, from);
        if !self.inner.filters.read().await.matches(&info) {
            return;
        }

        let info = Arc::new(info);
        for worker in self.inner.handlers.read().await.iter() {
            if self.inner.cancel.is_cancelled() {
                return;
            }
            if worker.deliver(info.clone()) == Delivery::Closed {
                debug!(handler = worker.name(), "transaction handler gone");
            }
        }
    }

    fn name(&self) -> &str {
        "transaction-processor"
    }
}
