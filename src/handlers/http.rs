//! HTTP handlers: publish trigger, presence and connection lookups, health.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::AppError;
use crate::models::channel::ChannelTarget;
use crate::models::connection::ConnectionInfo;
use crate::models::event::EventType;
use crate::services::RealtimeService;

/// Shared application state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub service: RealtimeService,
    /// Required `x-app-key` for publishing; `None` leaves the endpoint open.
    pub app_key: Option<String>,
}

impl AppState {
    pub fn new(service: RealtimeService, app_key: Option<String>) -> Self {
        Self { service, app_key }
    }

    pub fn service(&self) -> &RealtimeService {
        &self.service
    }
}

const HEADER_APP_KEY: &str = "x-app-key";

/// Body of `POST /api/publish`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub target: ChannelTarget,
}

/// POST /api/publish — fan an event out to its target channels.
pub async fn publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    validate_app_key(state.app_key.as_deref(), &headers)?;

    let receivers = state
        .service()
        .publish(body.event_type, body.data, &body.target)
        .await?;

    Ok(Json(json!({
        "ok": true,
        "type": body.event_type,
        "receivers": receivers
    })))
}

fn validate_app_key(expected: Option<&str>, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let key = headers
        .get(HEADER_APP_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if key.is_empty() {
        return Err(AppError::Auth("missing x-app-key".to_string()));
    }
    if key != expected {
        return Err(AppError::Auth("invalid x-app-key".to_string()));
    }
    Ok(())
}

/// GET /api/presence/:user_id — presence record, or `offline` when absent.
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let body = match state.service().get_presence(&user_id).await? {
        Some(record) => serde_json::to_value(record)?,
        None => json!({ "status": "offline" }),
    };
    Ok(Json(body))
}

/// GET /api/websites/:website_id/connections — live connections of a website.
pub async fn website_connections(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
) -> Result<Json<Vec<ConnectionInfo>>, AppError> {
    let connections = state.service().get_website_connections(&website_id).await?;
    Ok(Json(connections))
}

/// GET /health — liveness probe with local subscription stats.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let service = state.service();
    let active_channels = service.subscriptions().active_channels().await.len();
    let shutting_down = service.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "status": if shutting_down { "shutting_down" } else { "ok" },
            "service": "relay",
            "serverId": service.server_id(),
            "activeChannels": active_channels,
            "shuttingDown": shutting_down
        })),
    )
}
