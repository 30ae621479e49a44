//! Per-registration handler workers.
//!
//! Every handler registration owns a bounded FIFO queue drained by one
//! worker task. Delivery never waits: when a handler's queue is full the
//! item is dropped for that handler alone and counted, so a stuck handler
//! cannot stall the producer or its sibling handlers.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::Event;
use crate::handler::{EventHandler, TransactionHandler};
use crate::transaction::TransactionInfo;

/// Uniform call surface over the two handler traits.
#[async_trait]
pub(crate) trait Invoke<T>: Send + Sync + 'static {
    async fn invoke(&self, item: Arc<T>);
    fn label(&self) -> String;
}

#[async_trait]
impl Invoke<Event> for Arc<dyn EventHandler> {
    async fn invoke(&self, item: Arc<Event>) {
        self.handle(item).await
    }

    fn label(&self) -> String {
        self.name().to_string()
    }
}

#[async_trait]
impl Invoke<TransactionInfo> for Arc<dyn TransactionHandler> {
    async fn invoke(&self, item: Arc<TransactionInfo>) {
        self.on_transaction(item).await
    }

    fn label(&self) -> String {
        self.name().to_string()
    }
}

/// Result of offering one item to a handler's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// The queue was full; the item was dropped for this handler.
    Dropped,
    /// The worker has exited.
    Closed,
}

/// Producer side of one handler's queue.
pub(crate) struct HandlerWorker<T> {
    name: String,
    tx: mpsc::Sender<Arc<T>>,
    dropped: AtomicU64,
}

impl<T: Send + Sync + 'static> HandlerWorker<T> {
    /// Spawn the worker task. It exits when `cancel` fires or every
    /// producer handle is dropped. Must be called inside a Tokio runtime.
    pub(crate) fn spawn<H: Invoke<T>>(
        handler: H,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let name = handler.label();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_worker(handler, name.clone(), rx, cancel));
        Self {
            name,
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Items dropped because this handler's queue was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Offer `item` without waiting.
    pub(crate) fn deliver(&self, item: Arc<T>) -> Delivery {
        match self.tx.try_send(item) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(handler = %self.name, dropped = total, "handler queue full, dropping item");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

async fn run_worker<T, H>(
    handler: H,
    name: String,
    mut rx: mpsc::Receiver<Arc<T>>,
    cancel: CancellationToken,
) where
    T: Send + Sync + 'static,
    H: Invoke<T>,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(item) => item,
                None => break,
            },
        };

        if let Err(panic) = AssertUnwindSafe(handler.invoke(item)).catch_unwind().await {
            warn!(handler = %name, "handler panicked: {}", panic_message(panic.as_ref()));
        }
    }
    debug!(handler = %name, "handler worker exited");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::mock::sample_block;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn block_event(n: u64) -> Arc<Event> {
        Arc::new(Event::new_block(Arc::new(sample_block(n, 0))).unwrap())
    }

    #[tokio::test]
    async fn worker_survives_handler_panic() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn("flaky", move |ev: Arc<Event>| {
            let counter = counter.clone();
            async move {
                if ev.block_number() == 1 {
                    panic!("boom");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let cancel = CancellationToken::new();
        let worker = HandlerWorker::spawn(handler, 4, cancel.clone());
        assert_eq!(worker.name(), "flaky");
        for n in 1..=3 {
            assert_eq!(worker.deliver(block_event(n)), Delivery::Queued);
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn deliver_reports_closed_after_cancel() {
        let handler: Arc<dyn EventHandler> =
            Arc::new(handler_fn("noop", |_ev: Arc<Event>| async {}));
        let cancel = CancellationToken::new();
        let worker = HandlerWorker::spawn(handler, 1, cancel.clone());
        cancel.cancel();

        // the worker drops its receiver once it observes the cancellation
        tokio::time::timeout(Duration::from_secs(2), async {
            while worker.deliver(block_event(1)) != Delivery::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_without_waiting() {
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn("stuck", |_ev: Arc<Event>| {
            std::future::pending::<()>()
        }));
        let cancel = CancellationToken::new();
        let worker = HandlerWorker::spawn(handler, 1, cancel.clone());

        // the first item is taken by the worker and never finishes
        assert_eq!(worker.deliver(block_event(1)), Delivery::Queued);
        tokio::time::timeout(Duration::from_secs(2), async {
            while worker.deliver(block_event(2)) != Delivery::Queued {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let dropped_before = worker.dropped();

        assert_eq!(worker.deliver(block_event(3)), Delivery::Dropped);
        assert_eq!(worker.dropped(), dropped_before + 1);
        cancel.cancel();
    }
}
