//! API response models

use crate::orchestrator::ArtifactStatus;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_downloads: usize,
    pub available_ram_gb: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub success: bool,
    pub models: Vec<ArtifactStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelStatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub model: ArtifactStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}
