//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST probes, the WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers::{self, HealthResponse, ServiceInfo, WS_PATH},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::root, handlers::health),
    components(schemas(ServiceInfo, HealthResponse)),
    tags(
        (name = "Live Bridge API", description = "Bridges client sessions to Gemini Live")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(WS_PATH, get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
