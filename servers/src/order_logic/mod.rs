//! # Order Server
//!
//! HTTP and WebSocket front end over `lib_common`'s order domain and
//! notification core.
//!
//! ## Core Components:
//!
//! - **`config`**: CLI/env/file configuration.
//! - **`logger`**: tracing setup for the binary.
//! - **`auth`**: JWT verification and the caller extractors.
//! - **`state`**: the shared `AppState` and its wiring.
//! - **`api`**: order routes, reads, statistics and health.
//! - **`downstream`**: the dashboard WebSocket.

pub mod api;
pub mod auth;
pub mod config;
pub mod downstream;
pub mod logger;
pub mod state;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post, put};
use tower_http::cors::{Any, CorsLayer};

use crate::order_logic::state::AppState;

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    if allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Builds the full router for the order server.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/pedidos", post(api::create_order))
        .route("/pedidos/restaurante/me", get(api::restaurant_orders))
        .route("/pedidos/usuario/me", get(api::user_orders))
        .route("/pedidos/{pedido_id}", get(api::get_order))
        .route("/pedidos/{pedido_id}/status", put(api::update_status))
        .route("/restaurantes/estatisticas", get(api::restaurant_stats))
        .route("/ws/restaurante/{restaurante_id}", get(downstream::ws_handler))
        .route("/health", get(api::health_handler))
        .route("/health/sessions", get(api::session_health))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}
