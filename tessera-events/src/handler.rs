//! Event handler seam

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tessera_core::{ContextEvent, TesseraResult};

/// Callback invoked for each event a subscription matches.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ContextEvent) -> TesseraResult<()>;
}

pub type SharedHandler = Arc<dyn EventHandler>;

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ContextEvent) -> Fut + Send + Sync,
    Fut: Future<Output = TesseraResult<()>> + Send,
{
    async fn handle(&self, event: ContextEvent) -> TesseraResult<()> {
        (self.f)(event).await
    }
}

/// Wrap an async closure as a shared handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(ContextEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TesseraResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
