// Module: http
// Signaling socket and probes behind CORS and request tracing

pub mod error;
pub mod health;
pub mod websocket;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use duggu_core::auth::Authenticator;
use duggu_core::config::ServerConfig;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::dispatch::MessageDispatcher;

pub use error::AppError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<MessageDispatcher>,
    pub authenticator: Arc<dyn Authenticator>,
    pub cookie_name: String,
    pub max_message_size: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .merge(health::create_health_router())
        .route(&server.ws_path, get(websocket::websocket_handler));

    // Apply layers before state
    let router = router
        .layer(cors_layer(&server.allowed_origins))
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}

/// Credentialed CORS for the configured origins; unparsable entries are skipped.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
