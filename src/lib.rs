//! Weights Manager - download orchestrator for large model weight files
//!
//! Fetches catalogued artifacts either in one buffered HTTPS request or through
//! external resumable downloaders (wget, curl), retrying and falling back across
//! sources, streaming progress events to the caller, and only ever exposing
//! complete files at their final path.

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod session;
pub mod strategy;
pub mod system;
pub mod validate;

pub use catalog::{ArtifactDescriptor, Catalog, CatalogSettings, SourceCandidate, ToolKind};
pub use config::ManagerConfig;
pub use error::{DownloadError, DownloadResult, ErrorCode};
pub use events::{DownloadEvent, EventStream};
pub use orchestrator::{
    ArtifactStatus, DownloadSettings, HealthSnapshot, Orchestrator, OrchestratorDeps,
};
pub use session::SessionStore;
