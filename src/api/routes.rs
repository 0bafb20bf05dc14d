//! API route definitions

use crate::orchestrator::Orchestrator;
use axum::{Router, routing::get};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Catalog
        .route("/api/models", get(handlers::list_models))
        .route("/api/models/{id}/status", get(handlers::model_status))
        // Download stream (SSE) and cancellation
        .route(
            "/api/models/{id}/download",
            get(handlers::download_model).delete(handlers::cancel_download),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
