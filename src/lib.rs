//! Realtime fan-out, connection registry, and presence for stateless API servers.
//!
//! Events are published through a REST pub/sub store; every process keeps one long-lived
//! subscribe stream per watched channel and fans messages out to its local handlers.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::{Config, RealtimeConfig};
pub use error::{AppError, AppResult};
pub use handlers::http::AppState;
pub use repositories::{MemoryStore, RestStore, Store};
pub use services::{RealtimeService, Subscription};

use axum::routing::{get, post};
use handlers::http;
use tower_http::trace::TraceLayer;

/// Build the operator router (publish, presence, connections, health). Used by main and by
/// integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let api_routes = axum::Router::new()
        .route("/publish", post(http::publish))
        .route("/presence/:user_id", get(http::get_presence))
        .route(
            "/websites/:website_id/connections",
            get(http::website_connections),
        );

    axum::Router::new()
        .route("/health", get(http::health))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
