//! Buffered in-memory strategy: one GET, fully materialized, written once

use super::{TempFileGuard, TransferJob};
use crate::events::DownloadEvent;
use crate::retry::AttemptError;
use crate::validate::valid_url;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Method label reported for in-memory transfers
pub const MEMORY_METHOD: &str = "memory";

/// True when available memory covers twice the payload plus headroom
///
/// The factor of two leaves room for the in-flight buffer and the write-out.
pub fn memory_eligible(available_gb: f64, size_gb: f64, headroom_gb: f64) -> bool {
    available_gb >= 2.0 * size_gb + headroom_gb
}

/// Fetches a whole resource into memory
#[async_trait]
pub trait MemoryFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Production fetcher using reqwest
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests are bounded by `timeout` end to end
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .https_only(true)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MemoryFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()
            .context("Server returned an error status")?;

        response
            .bytes()
            .await
            .context("Failed to read response body")
    }
}

/// All-or-nothing transfer through memory
#[derive(Clone)]
pub struct MemoryStrategy {
    fetcher: Arc<dyn MemoryFetcher>,
}

impl MemoryStrategy {
    pub fn new(fetcher: Arc<dyn MemoryFetcher>) -> Self {
        Self { fetcher }
    }

    /// Try each allow-listed direct URL until one lands at the final path
    ///
    /// Returns `Exhausted` when every URL failed so the caller can fall back
    /// to external tools.
    pub async fn run(&self, job: &TransferJob<'_>) -> Result<(), AttemptError> {
        let cancel = job.session.cancel_token();

        for url in job.artifact.memory_urls() {
            if !valid_url(url, job.allowed_domains) {
                tracing::debug!(artifact = %job.artifact.id, url = %url, "Skipping URL outside allow-list");
                continue;
            }

            let started = tokio::time::Instant::now();
            let data = tokio::select! {
                () = cancel.cancelled() => return Err(AttemptError::Cancelled),
                result = self.fetcher.fetch(url) => result,
            };

            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        artifact = %job.artifact.id,
                        url = %url,
                        error = %e,
                        "In-memory download failed"
                    );
                    crate::metrics::record_attempt_failure(&job.artifact.id, MEMORY_METHOD, "unreachable");
                    job.events
                        .emit(DownloadEvent::warning("RAM download failed"))
                        .await;
                    continue;
                }
            };

            if let Err(e) = self.write_out(job, &data).await {
                tracing::warn!(
                    artifact = %job.artifact.id,
                    error = %e,
                    "Failed to write in-memory download"
                );
                job.events
                    .emit(DownloadEvent::warning("RAM download could not be written"))
                    .await;
                continue;
            }

            let elapsed = started.elapsed().as_secs_f64();
            let size_mb = data.len() as f64 / (1024.0 * 1024.0);
            let speed = if elapsed > 0.0 { size_mb / elapsed } else { 0.0 };

            tracing::info!(
                artifact = %job.artifact.id,
                bytes = data.len(),
                elapsed_secs = elapsed,
                "In-memory download complete"
            );

            job.session.record_progress(100);
            job.events.emit_progress(DownloadEvent::Progress {
                progress: 100,
                speed_mbps: (speed * 100.0).round() / 100.0,
                eta_seconds: 0,
                method: MEMORY_METHOD.to_string(),
                elapsed_secs: job.session.elapsed().as_secs_f64(),
            });

            return Ok(());
        }

        Err(AttemptError::Exhausted)
    }

    async fn write_out(&self, job: &TransferJob<'_>, data: &[u8]) -> std::io::Result<()> {
        let guard = TempFileGuard::new(job.temp_file);
        tokio::fs::write(guard.path(), data).await?;
        guard.commit(job.final_file).await
    }
}
