//! Event and transaction handler traits.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::event::Event;
use crate::transaction::TransactionInfo;

/// Receives events of the kinds it was registered for.
///
/// Each registration gets its own worker, so a slow handler only delays
/// itself. Failures are the handler's own business; a panic is caught and
/// logged by the worker.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>);

    /// Name used in logs.
    fn name(&self) -> &str {
        "event-handler"
    }
}

/// Receives enriched transactions that matched the processor's filters.
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    async fn on_transaction(&self, info: Arc<TransactionInfo>);

    /// Name used in logs.
    fn name(&self) -> &str {
        "transaction-handler"
    }
}

/// Adapts an async closure into a handler.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Build an [`EventHandler`] from an async closure.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

/// Build a [`TransactionHandler`] from an async closure.
pub fn tx_handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Arc<TransactionInfo>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: Arc<Event>) {
        (self.f)(event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<F, Fut> TransactionHandler for FnHandler<F>
where
    F: Fn(Arc<TransactionInfo>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_transaction(&self, info: Arc<TransactionInfo>) {
        (self.f)(info).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
