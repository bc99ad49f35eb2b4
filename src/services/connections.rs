//! Connection registry: short-lived connection records plus a per-website index of their ids.

use crate::error::{AppError, AppResult};
use crate::models::connection::ConnectionInfo;
use crate::repositories::store::Store;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn Store>,
    key_prefix: String,
    server_id: Arc<str>,
    connection_ttl: Duration,
    website_set_ttl: Duration,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        key_prefix: impl Into<String>,
        server_id: impl Into<Arc<str>>,
        connection_ttl: Duration,
        website_set_ttl: Duration,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            server_id: server_id.into(),
            connection_ttl,
            website_set_ttl,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn connection_key(&self, connection_id: &str) -> String {
        format!("{}:conn:{}", self.key_prefix, connection_id)
    }

    fn website_key(&self, website_id: &str) -> String {
        format!("{}:website:{}:connections", self.key_prefix, website_id)
    }

    async fn write(&self, info: &ConnectionInfo) -> AppResult<()> {
        let record = serde_json::to_string(info)?;
        self.store
            .set_ex(
                &self.connection_key(&info.connection_id),
                &record,
                self.connection_ttl,
            )
            .await
    }

    /// Store the record and index it under its website. The website index TTL restarts on
    /// every registration, not on heartbeats.
    #[instrument(skip(self, info), fields(connection_id = %info.connection_id))]
    pub async fn register_connection(&self, info: &ConnectionInfo) -> AppResult<()> {
        self.write(info).await?;
        if let Some(website_id) = info.website_id.as_deref() {
            let key = self.website_key(website_id);
            self.store.sadd(&key, &info.connection_id).await?;
            self.store.expire(&key, self.website_set_ttl).await?;
        }
        info!(server_id = %info.server_id, "connection registered");
        Ok(())
    }

    /// Refresh a live record. Returns `false` when the record already expired; the caller
    /// must register again.
    #[instrument(skip(self))]
    pub async fn heartbeat_connection(&self, connection_id: &str) -> AppResult<bool> {
        let Some(mut info) = self.get_connection(connection_id).await? else {
            debug!("heartbeat for expired connection");
            return Ok(false);
        };
        info.last_heartbeat = chrono::Utc::now().timestamp_millis();
        self.write(&info).await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn unregister_connection(&self, connection_id: &str) -> AppResult<()> {
        let Some(info) = self.get_connection(connection_id).await? else {
            return Ok(());
        };
        if let Some(website_id) = info.website_id.as_deref() {
            self.store
                .srem(&self.website_key(website_id), connection_id)
                .await?;
        }
        self.store.del(&self.connection_key(connection_id)).await?;
        info!("connection unregistered");
        Ok(())
    }

    /// The live record, or `None` if it expired, never existed, or cannot be decoded.
    pub async fn get_connection(&self, connection_id: &str) -> AppResult<Option<ConnectionInfo>> {
        let Some(raw) = self.store.get(&self.connection_key(connection_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<ConnectionInfo>(&raw) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                let err = AppError::MalformedMessage(e.to_string());
                warn!(connection_id = %connection_id, error = %err, "unreadable connection record");
                Ok(None)
            }
        }
    }

    /// Live connections of a website. Ids whose record expired are skipped.
    pub async fn get_website_connections(&self, website_id: &str) -> AppResult<Vec<ConnectionInfo>> {
        let ids = self.store.smembers(&self.website_key(website_id)).await?;
        let records = try_join_all(ids.iter().map(|id| self.get_connection(id))).await?;
        Ok(records.into_iter().flatten().collect())
    }

    /// Whether the connection was accepted by this process.
    pub async fn is_local_connection(&self, connection_id: &str) -> AppResult<bool> {
        Ok(self
            .get_connection(connection_id)
            .await?
            .is_some_and(|info| info.server_id.as_str() == self.server_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::memory::MemoryStore;

    fn registry(store: &MemoryStore, server_id: &str) -> ConnectionRegistry {
        ConnectionRegistry::new(
            Arc::new(store.clone()),
            "rt",
            server_id,
            Duration::from_secs(30),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn register_read_unregister() {
        let store = MemoryStore::new();
        let registry = registry(&store, "srv-a");
        let info = ConnectionInfo::new("k1", "srv-a")
            .with_visitor("v1")
            .with_website("w1");

        registry.register_connection(&info).await.unwrap();
        assert_eq!(registry.get_connection("k1").await.unwrap(), Some(info.clone()));
        assert_eq!(registry.get_website_connections("w1").await.unwrap(), vec![info]);

        registry.unregister_connection("k1").await.unwrap();
        assert_eq!(registry.get_connection("k1").await.unwrap(), None);
        assert!(registry.get_website_connections("w1").await.unwrap().is_empty());

        registry.unregister_connection("k1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_records_vanish_from_website_listing() {
        let store = MemoryStore::new();
        let registry = registry(&store, "srv-a");
        registry
            .register_connection(&ConnectionInfo::new("stale", "srv-a").with_website("w1"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        registry
            .register_connection(&ConnectionInfo::new("fresh", "srv-a").with_website("w1"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(registry.get_connection("stale").await.unwrap(), None);
        let live = registry.get_website_connections("w1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].connection_id, "fresh");
        // The index still names the stale id; only reads filter it.
        assert_eq!(store.smembers("rt:website:w1:connections").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn website_index_ttl_restarts_on_registration() {
        let store = MemoryStore::new();
        let registry = registry(&store, "srv-a");
        let key = "rt:website:w1:connections";
        registry
            .register_connection(&ConnectionInfo::new("k1", "srv-a").with_website("w1"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(50 * 60)).await;
        registry
            .register_connection(&ConnectionInfo::new("k2", "srv-a").with_website("w1"))
            .await
            .unwrap();

        // 70 minutes after the first registration, 20 after the second.
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        assert_eq!(store.smembers(key).await.unwrap().len(), 2);

        // The index lives an hour past the latest registration.
        tokio::time::advance(Duration::from_secs(39 * 60)).await;
        assert_eq!(store.smembers(key).await.unwrap().len(), 2);
        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert!(store.smembers(key).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_live_records_only() {
        let store = MemoryStore::new();
        let registry = registry(&store, "srv-a");
        registry
            .register_connection(&ConnectionInfo::new("k1", "srv-a"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(registry.heartbeat_connection("k1").await.unwrap());
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(registry.get_connection("k1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!registry.heartbeat_connection("k1").await.unwrap());
        assert_eq!(registry.get_connection("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn locality_compares_server_ids() {
        let store = MemoryStore::new();
        let here = registry(&store, "srv-a");
        let there = registry(&store, "srv-b");
        here.register_connection(&ConnectionInfo::new("k1", "srv-a"))
            .await
            .unwrap();

        assert!(here.is_local_connection("k1").await.unwrap());
        assert!(!there.is_local_connection("k1").await.unwrap());
        assert!(!here.is_local_connection("missing").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_record_reads_as_absent() {
        let store = MemoryStore::new();
        let registry = registry(&store, "srv-a");
        store
            .set_ex("rt:conn:bad", "{not json", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(registry.get_connection("bad").await.unwrap(), None);
        assert!(!registry.heartbeat_connection("bad").await.unwrap());
    }
}
