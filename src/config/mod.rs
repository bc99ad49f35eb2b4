//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:3000`).
    pub server_addr: SocketAddr,
    /// Base URL of the REST pub/sub store (e.g. `https://eu1-fancy-cat.upstash.io`).
    pub store_url: String,
    /// Bearer token for the store.
    pub store_token: String,
    /// Key required in `x-app-key` for the publish endpoint. `None` leaves it open.
    pub app_key: Option<String>,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    pub realtime: RealtimeConfig,
}

/// Tunables of the realtime service itself, independent of how it is hosted.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Prefix for every pub/sub channel name.
    pub channel_prefix: String,
    /// Prefix for every key/value and set key.
    pub key_prefix: String,
    /// Delay before a stream consumer reconnects after a failure.
    pub reconnect_delay: Duration,
    pub connection_ttl: Duration,
    pub website_set_ttl: Duration,
    pub presence_ttl: Duration,
    /// Fixed process identity. Generated at construction when `None`.
    pub server_id: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "realtime".to_string(),
            key_prefix: "realtime".to_string(),
            reconnect_delay: Duration::from_secs(5),
            connection_ttl: Duration::from_secs(30),
            website_set_ttl: Duration::from_secs(60 * 60),
            presence_ttl: Duration::from_secs(5 * 60),
            server_id: None,
        }
    }
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let store_url = required(&lookup, "STORE_REST_URL")?;
        let store_token = required(&lookup, "STORE_REST_TOKEN")?;
        let app_key = lookup("APP_KEY").filter(|k| !k.is_empty());
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let defaults = RealtimeConfig::default();
        let realtime = RealtimeConfig {
            channel_prefix: lookup("CHANNEL_PREFIX").unwrap_or(defaults.channel_prefix),
            key_prefix: lookup("KEY_PREFIX").unwrap_or(defaults.key_prefix),
            reconnect_delay: duration(&lookup, "RECONNECT_DELAY_MS", Duration::from_millis)?
                .unwrap_or(defaults.reconnect_delay),
            connection_ttl: duration(&lookup, "CONNECTION_TTL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.connection_ttl),
            website_set_ttl: duration(&lookup, "WEBSITE_SET_TTL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.website_set_ttl),
            presence_ttl: duration(&lookup, "PRESENCE_TTL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.presence_ttl),
            server_id: None,
        };

        Ok(Self {
            server_addr,
            store_url,
            store_token,
            app_key,
            log_level,
            realtime,
        })
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigLoadError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigLoadError::Missing(key)),
    }
}

fn duration<F>(
    lookup: &F,
    key: &'static str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigLoadError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(unit)
                .map_err(|_| ConfigLoadError::InvalidNumber(key))
        })
        .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{0} must be a non-negative integer")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_store_credentials_fail_fast() {
        let err = Config::from_lookup(lookup_from(&[("STORE_REST_URL", "https://x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Missing("STORE_REST_TOKEN")));

        let err = Config::from_lookup(lookup_from(&[("STORE_REST_TOKEN", "t")])).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Missing("STORE_REST_URL")));
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE_REST_URL", "https://store.example"),
            ("STORE_REST_TOKEN", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.server_addr.port(), 3000);
        assert!(config.app_key.is_none());
        assert_eq!(config.realtime.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.realtime.connection_ttl, Duration::from_secs(30));
        assert_eq!(config.realtime.website_set_ttl, Duration::from_secs(3600));
        assert_eq!(config.realtime.presence_ttl, Duration::from_secs(300));
    }

    #[test]
    fn overrides_and_invalid_numbers() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE_REST_URL", "https://store.example"),
            ("STORE_REST_TOKEN", "secret"),
            ("RECONNECT_DELAY_MS", "250"),
            ("CHANNEL_PREFIX", "acme"),
        ]))
        .unwrap();
        assert_eq!(config.realtime.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.realtime.channel_prefix, "acme");

        let err = Config::from_lookup(lookup_from(&[
            ("STORE_REST_URL", "https://store.example"),
            ("STORE_REST_TOKEN", "secret"),
            ("PRESENCE_TTL_SECS", "five"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidNumber("PRESENCE_TTL_SECS")));
    }
}
