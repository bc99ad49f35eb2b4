//! The realtime service: one explicitly constructed object per process that owns the
//! publisher, subscriptions, connection registry, and presence, and shuts them down together.

use crate::config::RealtimeConfig;
use crate::error::AppResult;
use crate::models::channel::ChannelTarget;
use crate::models::connection::ConnectionInfo;
use crate::models::event::EventType;
use crate::models::presence::{generate_server_id, PresenceRecord, PresenceStatus};
use crate::repositories::store::Store;
use crate::services::connections::ConnectionRegistry;
use crate::services::consumer::ConsumerState;
use crate::services::handler::EventHandler;
use crate::services::lifecycle::Lifecycle;
use crate::services::presence::PresenceService;
use crate::services::publisher::Publisher;
use crate::services::subscriptions::{Subscription, SubscriptionManager};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

#[derive(Clone)]
pub struct RealtimeService {
    server_id: Arc<str>,
    lifecycle: Lifecycle,
    publisher: Publisher,
    subscriptions: SubscriptionManager,
    connections: ConnectionRegistry,
    presence: PresenceService,
    shutdown_gate: Arc<Mutex<()>>,
}

impl RealtimeService {
    pub fn new(store: Arc<dyn Store>, config: RealtimeConfig) -> Self {
        let server_id: Arc<str> = config
            .server_id
            .clone()
            .unwrap_or_else(generate_server_id)
            .into();
        let lifecycle = Lifecycle::new();
        let publisher = Publisher::new(store.clone(), lifecycle.clone(), &config.channel_prefix);
        let subscriptions = SubscriptionManager::new(
            store.clone(),
            lifecycle.clone(),
            &config.channel_prefix,
            config.reconnect_delay,
        );
        let connections = ConnectionRegistry::new(
            store.clone(),
            &config.key_prefix,
            server_id.clone(),
            config.connection_ttl,
            config.website_set_ttl,
        );
        let presence = PresenceService::new(
            store,
            publisher.clone(),
            &config.key_prefix,
            config.presence_ttl,
        );
        info!(server_id = %server_id, "realtime service created");

        Self {
            server_id,
            lifecycle,
            publisher,
            subscriptions,
            connections,
            presence,
            shutdown_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Identity of this process, stamped on every connection it registers.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    // --- Publish / subscribe ---

    pub async fn publish(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        target: &ChannelTarget,
    ) -> AppResult<u64> {
        self.publisher.publish(event_type, data, target).await
    }

    pub async fn subscribe<H: EventHandler>(
        &self,
        channel: &str,
        handler: H,
    ) -> AppResult<Subscription> {
        self.subscriptions.subscribe(channel, handler).await
    }

    pub async fn subscribe_to_channels<H: EventHandler>(
        &self,
        target: &ChannelTarget,
        handler: H,
    ) -> AppResult<Subscription> {
        self.subscriptions.subscribe_to_channels(target, handler).await
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.subscriptions.unsubscribe(subscription).await
    }

    pub async fn consumer_state(&self, channel: &str) -> Option<watch::Receiver<ConsumerState>> {
        self.subscriptions.consumer_state(channel).await
    }

    // --- Connections ---

    /// A connection record owned by this process.
    pub fn new_connection(&self, connection_id: impl Into<String>) -> ConnectionInfo {
        ConnectionInfo::new(connection_id, self.server_id())
    }

    pub async fn register_connection(&self, info: &ConnectionInfo) -> AppResult<()> {
        self.connections.register_connection(info).await
    }

    pub async fn heartbeat_connection(&self, connection_id: &str) -> AppResult<bool> {
        self.connections.heartbeat_connection(connection_id).await
    }

    pub async fn unregister_connection(&self, connection_id: &str) -> AppResult<()> {
        self.connections.unregister_connection(connection_id).await
    }

    pub async fn get_connection(&self, connection_id: &str) -> AppResult<Option<ConnectionInfo>> {
        self.connections.get_connection(connection_id).await
    }

    pub async fn get_website_connections(&self, website_id: &str) -> AppResult<Vec<ConnectionInfo>> {
        self.connections.get_website_connections(website_id).await
    }

    pub async fn is_local_connection(&self, connection_id: &str) -> AppResult<bool> {
        self.connections.is_local_connection(connection_id).await
    }

    // --- Presence ---

    pub async fn update_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        website_id: Option<&str>,
    ) -> AppResult<()> {
        self.presence
            .update_presence(user_id, status, website_id)
            .await
    }

    pub async fn get_presence(&self, user_id: &str) -> AppResult<Option<PresenceRecord>> {
        self.presence.get_presence(user_id).await
    }

    // --- Lifecycle ---

    /// Reject new publishes and subscribes, cancel every stream consumer, and wait for them
    /// to stop. Safe to call repeatedly; concurrent callers return once the first finishes.
    ///
    /// A handler may call this from inside its own dispatch: the consumer running that
    /// handler is cancelled but not awaited, and stops once the handler returns. Handlers of
    /// two different channels calling it at the same time will wait on each other.
    pub async fn shutdown(&self) {
        let _gate = self.shutdown_gate.lock().await;
        if self.lifecycle.begin_shutdown() {
            info!(server_id = %self.server_id, "realtime service shutting down");
        }
        self.subscriptions.close_all().await;
    }
}
