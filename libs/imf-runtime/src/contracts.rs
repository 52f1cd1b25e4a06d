use async_trait::async_trait;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use crate::registry::InitContext;

/// Converts an `Arc<Self>` into a type-erased `Arc` for typed lookups.
///
/// Blanket-implemented for every sized `Send + Sync + 'static` type, so
/// services never implement it by hand.
pub trait AsAnyArc: Send + Sync + 'static {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A running service owned by the registry.
///
/// Construction is the factory's job; the service itself only knows how to
/// stop and how to report its own liveness.
#[async_trait]
pub trait Service: AsAnyArc {
    /// Called once during registry shutdown, in reverse dependency order.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Liveness probe. `Ok` means healthy, with an optional human-readable
    /// detail; `Err` means unhealthy and the error becomes the detail.
    ///
    /// The registry bounds every call with the probe timeout.
    async fn health(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Builds a service once its dependencies are running.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn create(&self, ctx: InitContext) -> anyhow::Result<Arc<dyn Service>>;
}

/// Adapter turning an async closure into a [`ServiceFactory`].
pub(crate) struct FnFactory<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> ServiceFactory for FnFactory<F>
where
    F: Fn(InitContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Arc<dyn Service>>> + Send + 'static,
{
    async fn create(&self, ctx: InitContext) -> anyhow::Result<Arc<dyn Service>> {
        (self.0)(ctx).await
    }
}
