//! User presence: online/away records with a TTL, offline as an absent key, and live
//! updates pushed to the website dashboard.

use crate::error::{AppError, AppResult};
use crate::models::channel::ChannelTarget;
use crate::models::event::{EventType, UserPresenceUpdateData};
use crate::models::presence::{PresenceRecord, PresenceStatus};
use crate::repositories::store::Store;
use crate::services::publisher::Publisher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn Store>,
    publisher: Publisher,
    key_prefix: String,
    presence_ttl: Duration,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Publisher,
        key_prefix: impl Into<String>,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            key_prefix: key_prefix.into(),
            presence_ttl,
        }
    }

    fn presence_key(&self, user_id: &str) -> String {
        format!("{}:presence:{}", self.key_prefix, user_id)
    }

    #[instrument(skip(self))]
    pub async fn update_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        website_id: Option<&str>,
    ) -> AppResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let key = self.presence_key(user_id);
        let website_id = website_id.filter(|id| !id.is_empty());

        match status {
            PresenceStatus::Offline => self.store.del(&key).await?,
            PresenceStatus::Online | PresenceStatus::Away => {
                let record = PresenceRecord {
                    status,
                    last_seen: now,
                    website_id: website_id.map(str::to_string),
                };
                self.store
                    .set_ex(&key, &serde_json::to_string(&record)?, self.presence_ttl)
                    .await?;
            }
        }
        info!(status = status.as_str(), "presence updated");

        if let Some(website_id) = website_id {
            let data = serde_json::to_value(UserPresenceUpdateData {
                user_id: user_id.to_string(),
                status,
                last_seen: now,
            })?;
            self.publisher
                .publish(
                    EventType::UserPresenceUpdate,
                    data,
                    &ChannelTarget::website(website_id),
                )
                .await?;
        }
        Ok(())
    }

    /// Current presence, `None` meaning offline. Expired, deleted, and never-seen users all
    /// read the same.
    pub async fn get_presence(&self, user_id: &str) -> AppResult<Option<PresenceRecord>> {
        let Some(raw) = self.store.get(&self.presence_key(user_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<PresenceRecord>(&raw) {
            Ok(record) if record.status == PresenceStatus::Offline => Ok(None),
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                let err = AppError::MalformedMessage(e.to_string());
                warn!(user_id = %user_id, error = %err, "unreadable presence record");
                Ok(None)
            }
        }
    }
}
