//! Local event handlers registered against a channel.

use crate::models::event::EventEnvelope;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Identity of one handler registration, unique within a process.
pub type HandlerId = u64;

/// Receives every event delivered on the channels it is subscribed to.
///
/// Errors are logged by the dispatcher and never reach sibling handlers or the stream.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<EventEnvelope>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<EventEnvelope>) -> anyhow::Result<()> {
        (self)(event).await
    }
}
