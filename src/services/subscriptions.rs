//! Channel subscriptions: ref-counted local handlers, one stream consumer per watched channel.

use crate::error::{AppError, AppResult};
use crate::models::channel::ChannelTarget;
use crate::repositories::store::Store;
use crate::services::consumer::{dispatching_consumer, ConsumerState, HandlerSet, StreamConsumer};
use crate::services::handler::{EventHandler, HandlerId};
use crate::services::lifecycle::Lifecycle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    channel: String,
    handler_id: HandlerId,
}

/// Handle returned by a subscribe call. Pass it to [`SubscriptionManager::unsubscribe`];
/// unsubscribing the same handle again does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    registrations: Vec<Registration>,
}

impl Subscription {
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|r| r.channel.as_str())
    }
}

struct ChannelEntry {
    handlers: HandlerSet,
    consumer: StreamConsumer,
}

#[derive(Default)]
struct Channels {
    active: HashMap<String, ChannelEntry>,
    /// Cancelled consumers that may still be finishing a dispatch.
    retired: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn Store>,
    channels: Arc<Mutex<Channels>>,
    next_handler_id: Arc<AtomicU64>,
    lifecycle: Lifecycle,
    channel_prefix: String,
    reconnect_delay: Duration,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: Lifecycle,
        channel_prefix: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(Channels::default())),
            next_handler_id: Arc::new(AtomicU64::new(1)),
            lifecycle,
            channel_prefix: channel_prefix.into(),
            reconnect_delay,
        }
    }

    /// Register `handler` on `channel`. The first handler of a channel starts its consumer.
    pub async fn subscribe<H: EventHandler>(
        &self,
        channel: &str,
        handler: H,
    ) -> AppResult<Subscription> {
        let registration = self.register(channel, Arc::new(handler)).await?;
        Ok(Subscription {
            registrations: vec![registration],
        })
    }

    /// Subscribe one shared handler to every channel `target` resolves to.
    pub async fn subscribe_to_channels<H: EventHandler>(
        &self,
        target: &ChannelTarget,
        handler: H,
    ) -> AppResult<Subscription> {
        let channels = target.channels(&self.channel_prefix);
        if channels.is_empty() {
            return Err(AppError::NoTarget);
        }

        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let mut subscription = Subscription {
            registrations: Vec::with_capacity(channels.len()),
        };
        for channel in &channels {
            match self.register(channel, handler.clone()).await {
                Ok(registration) => subscription.registrations.push(registration),
                Err(e) => {
                    self.unsubscribe(&subscription).await;
                    return Err(e);
                }
            }
        }
        Ok(subscription)
    }

    #[instrument(skip(self, handler))]
    async fn register(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> AppResult<Registration> {
        self.lifecycle.ensure_running()?;
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.channels.lock().await;
        // Shutdown may have drained the map while we waited for the lock.
        self.lifecycle.ensure_running()?;
        match channels.active.get(channel) {
            Some(entry) => {
                entry.handlers.write().await.insert(handler_id, handler);
                debug!(channel = %channel, handler_id, "handler added");
            }
            None => {
                let handlers: HandlerSet =
                    Arc::new(RwLock::new(HashMap::from([(handler_id, handler)])));
                let consumer = StreamConsumer::spawn(
                    self.store.clone(),
                    channel.to_string(),
                    handlers.clone(),
                    self.reconnect_delay,
                );
                channels
                    .active
                    .insert(channel.to_string(), ChannelEntry { handlers, consumer });
                info!(channel = %channel, "stream consumer started");
            }
        }

        Ok(Registration {
            channel: channel.to_string(),
            handler_id,
        })
    }

    /// Remove the handlers held by `subscription`. Channels left without handlers have their
    /// consumer cancelled; [`close_all`](Self::close_all) still waits for it.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut channels = self.channels.lock().await;
        channels.retired.retain(|task| !task.is_finished());
        for registration in &subscription.registrations {
            let Some(entry) = channels.active.get(&registration.channel) else {
                continue;
            };
            let mut handlers = entry.handlers.write().await;
            if handlers.remove(&registration.handler_id).is_none() {
                continue;
            }
            let now_empty = handlers.is_empty();
            drop(handlers);
            debug!(
                channel = %registration.channel,
                handler_id = registration.handler_id,
                "handler removed"
            );
            if now_empty {
                if let Some(entry) = channels.active.remove(&registration.channel) {
                    info!(channel = %registration.channel, "stream consumer stopping");
                    // Not awaited: a handler may be unsubscribing from inside this consumer's
                    // dispatch.
                    let task = entry.consumer.cancel();
                    channels.retired.push(task);
                }
            }
        }
    }

    /// Cancel every consumer, including ones already retired by `unsubscribe`, and wait for
    /// all of them to stop. When called from a handler, the consumer dispatching that handler
    /// is cancelled but not awaited, since it is waiting on the caller.
    pub(crate) async fn close_all(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut channels = self.channels.lock().await;
            let mut tasks: Vec<JoinHandle<()>> = channels
                .active
                .drain()
                .map(|(_, entry)| entry.consumer.cancel())
                .collect();
            tasks.append(&mut channels.retired);
            tasks
        };
        if tasks.is_empty() {
            return;
        }

        let caller = dispatching_consumer();
        let (own, others): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| Some(task.id()) == caller);
        if !own.is_empty() {
            warn!("closing from inside a dispatch; that consumer stops once the handler returns");
        }
        info!(count = others.len(), "closing stream consumers");
        for joined in futures::future::join_all(others).await {
            if let Err(e) = joined {
                error!(error = %e, "stream consumer task failed");
            }
        }
    }

    pub async fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().await.active.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn handler_count(&self, channel: &str) -> usize {
        let handlers = match self.channels.lock().await.active.get(channel) {
            Some(entry) => entry.handlers.clone(),
            None => return 0,
        };
        let count = handlers.read().await.len();
        count
    }

    pub async fn consumer_state(&self, channel: &str) -> Option<watch::Receiver<ConsumerState>> {
        self.channels
            .lock()
            .await
            .active
            .get(channel)
            .map(|entry| entry.consumer.watch_state())
    }
}
