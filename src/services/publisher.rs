//! Publish router: one event, serialized once, fanned out to every targeted channel.

use crate::error::{AppError, AppResult};
use crate::models::channel::ChannelTarget;
use crate::models::event::{EventEnvelope, EventType};
use crate::repositories::store::Store;
use crate::services::lifecycle::Lifecycle;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn Store>,
    lifecycle: Lifecycle,
    channel_prefix: String,
}

impl Publisher {
    pub fn new(store: Arc<dyn Store>, lifecycle: Lifecycle, channel_prefix: impl Into<String>) -> Self {
        Self {
            store,
            lifecycle,
            channel_prefix: channel_prefix.into(),
        }
    }

    /// Publish `data` as `event_type` to every channel in `target`.
    ///
    /// Returns the number of receivers summed over all channels. Zero is a valid answer: nobody
    /// is watching those channels right now. Fails as a whole if any channel's publish fails.
    #[instrument(skip(self, data))]
    pub async fn publish(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        target: &ChannelTarget,
    ) -> AppResult<u64> {
        self.lifecycle.ensure_running()?;
        let channels = target.channels(&self.channel_prefix);
        if channels.is_empty() {
            return Err(AppError::NoTarget);
        }
        event_type.validate(&data)?;

        let payload = serde_json::to_string(&EventEnvelope::new(event_type, data))?;
        let sends = channels.iter().map(|channel| {
            let payload = payload.as_str();
            async move {
                self.store.publish(channel, payload).await.map_err(|e| {
                    warn!(channel = %channel, error = %e, "publish failed");
                    e
                })
            }
        });
        let receivers: u64 = try_join_all(sends).await?.into_iter().sum();

        info!(event = %event_type, channels = channels.len(), receivers, "published");
        Ok(receivers)
    }
}
