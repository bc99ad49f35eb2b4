//! REST pub/sub store client: one-shot commands over POST, subscriptions over a streamed GET.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::repositories::store::{ttl_secs, ByteStream, Store};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// Store reached through its REST API (Upstash-compatible).
#[derive(Clone)]
pub struct RestStore {
    http: reqwest::Client,
    base_url: Url,
    token: Arc<str>,
}

impl RestStore {
    /// Create a client. Fails immediately on a missing token or an unusable URL.
    pub fn new(base_url: &str, token: &str) -> AppResult<Self> {
        if token.trim().is_empty() {
            return Err(AppError::Config("store token is empty".to_string()));
        }
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid store url {:?}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "store url {} cannot be used as a base",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            token: Arc::from(token),
        })
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        Self::new(&config.store_url, &config.store_token)
    }

    fn subscribe_url(&self, channel: &str) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("store url {} has no path", self.base_url)))?
            .pop_if_empty()
            .push("subscribe")
            .push(channel);
        Ok(url)
    }

    /// Run one command, e.g. `["SETEX", "k", "30", "v"]`, and return its `result`.
    async fn command(&self, args: &[&str]) -> AppResult<serde_json::Value> {
        let res = self
            .http
            .post(self.base_url.clone())
            .bearer_auth(&*self.token)
            .timeout(COMMAND_TIMEOUT)
            .json(args)
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await?;
        let parsed = serde_json::from_str::<CommandResponse>(&text);
        match parsed {
            Ok(CommandResponse { error: Some(e), .. }) => Err(AppError::Transport(format!(
                "{} failed: {}",
                args.first().copied().unwrap_or("command"),
                e
            ))),
            Ok(body) if status.is_success() => Ok(body.result),
            _ => Err(AppError::Transport(format!(
                "store returned {}: {}",
                status, text
            ))),
        }
    }

    async fn command_unit(&self, args: &[&str]) -> AppResult<()> {
        self.command(args).await.map(|_| ())
    }
}

#[async_trait]
impl Store for RestStore {
    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        let result = self.command(&["PUBLISH", channel, message]).await?;
        let count = result.as_u64().ok_or_else(|| {
            AppError::Transport(format!("PUBLISH returned non-integer {}", result))
        })?;
        debug!(channel = %channel, count, "published");
        Ok(count)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        match self.command(&["GET", key]).await? {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(s) => Ok(Some(s)),
            other => Err(AppError::Transport(format!("GET returned {}", other))),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let secs = ttl_secs(ttl).to_string();
        self.command_unit(&["SETEX", key, &secs, value]).await
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        self.command_unit(&["DEL", key]).await
    }

    async fn sadd(&self, key: &str, member: &str) -> AppResult<()> {
        self.command_unit(&["SADD", key, member]).await
    }

    async fn srem(&self, key: &str, member: &str) -> AppResult<()> {
        self.command_unit(&["SREM", key, member]).await
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        match self.command(&["SMEMBERS", key]).await? {
            serde_json::Value::Null => Ok(Vec::new()),
            value => Ok(serde_json::from_value(value)?),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<()> {
        let secs = ttl_secs(ttl).to_string();
        self.command_unit(&["EXPIRE", key, &secs]).await
    }

    async fn subscribe(&self, channel: &str) -> AppResult<ByteStream> {
        let url = self.subscribe_url(channel)?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&*self.token)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(AppError::Transport(format!(
                "subscribe to {} returned {}",
                channel,
                res.status()
            )));
        }
        info!(channel = %channel, "subscribe stream opened");
        Ok(res.bytes_stream().map(|chunk| chunk.map_err(AppError::from)).boxed())
    }
}
