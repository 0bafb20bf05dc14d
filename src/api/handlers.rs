//! API request handlers

use super::models::{CancelResponse, HealthResponse, ModelListResponse, ModelStatusResponse};
use super::routes::AppState;
use crate::error::DownloadError;
use crate::events::DownloadEvent;
use crate::validate::valid_artifact_id;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;

/// SSE keep-alive interval, keeps proxies from closing idle download streams
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// GET /health - Manager health check
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.orchestrator.health();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            active_downloads: snapshot.active_downloads,
            available_ram_gb: (snapshot.available_ram_gb * 100.0).round() / 100.0,
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /api/models - List catalog entries with download state
pub async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    Json(ModelListResponse {
        success: true,
        models: state.orchestrator.list_artifacts(),
    })
}

/// GET /api/models/{id}/status - Single catalog entry
pub async fn model_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelStatusResponse>, DownloadError> {
    let model = state.orchestrator.status(&id)?;
    Ok(Json(ModelStatusResponse {
        success: true,
        model,
    }))
}

/// GET /api/models/{id}/download - Start a download and stream its events
///
/// Closing the connection drops the stream, which cancels the download.
pub async fn download_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, DownloadError> {
    if !valid_artifact_id(&id) {
        return Err(DownloadError::InvalidInput(format!("invalid artifact id: {id:?}")));
    }

    tracing::info!(artifact = %id, "Download stream opened");

    let stream = state
        .orchestrator
        .download(&id)
        .filter_map(|event| to_sse_event(&event).map(Ok));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("ping"),
    ))
}

fn to_sse_event(event: &DownloadEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize download event");
            None
        }
    }
}

/// DELETE /api/models/{id}/download - Cancel a running download
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, DownloadError> {
    if !valid_artifact_id(&id) {
        return Err(DownloadError::InvalidInput(format!("invalid artifact id: {id:?}")));
    }

    let cancelled = state.orchestrator.cancel(&id).await;
    let message = if cancelled {
        "Cancelled"
    } else {
        "No active download"
    };

    Ok(Json(CancelResponse {
        success: cancelled,
        message: message.to_string(),
    }))
}
