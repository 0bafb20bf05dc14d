//! Download orchestrator: strategy selection, retry/fallback, sessions and cancellation

use crate::catalog::{ArtifactDescriptor, Catalog, ToolCandidate};
use crate::config::{ManagerConfig, ToolPaths};
use crate::error::{DownloadError, DownloadResult};
use crate::events::{DownloadEvent, EventSink, EventStream, single_event};
use crate::metrics;
use crate::retry::{AttemptError, RetryPolicy, for_each_candidate, with_retries};
use crate::session::{DownloadSession, SessionGuard, SessionStore};
use crate::strategy::memory::MEMORY_METHOD;
use crate::strategy::{
    ExternalToolStrategy, HttpFetcher, MemoryFetcher, MemoryStrategy, SystemToolLauncher,
    TempFileGuard, ToolLauncher, TransferJob, memory_eligible,
};
use crate::system::{SysinfoProbe, SystemProbe};
use crate::validate::{valid_artifact_id, valid_url};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// How often `cancel` checks whether the session has ended during the grace wait
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Tunables for the transfer loop, taken from [`ManagerConfig`]
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub cancel_grace: Duration,
    pub event_buffer: usize,
    pub tools: ToolPaths,
}

impl From<&ManagerConfig> for DownloadSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            retry: RetryPolicy {
                max_attempts: config.max_retries,
                backoff: config.retry_backoff(),
            },
            cancel_grace: config.cancel_grace(),
            event_buffer: config.event_buffer.max(1),
            tools: config.tools.clone(),
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

/// Collaborators injected into the orchestrator
pub struct OrchestratorDeps {
    pub fetcher: Arc<dyn MemoryFetcher>,
    pub launcher: Arc<dyn ToolLauncher>,
    pub probe: Arc<dyn SystemProbe>,
    pub sessions: SessionStore,
}

impl OrchestratorDeps {
    /// Production collaborators: reqwest, tokio::process and sysinfo
    pub fn system(config: &ManagerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(
                config.memory_fetch_timeout_secs,
            ))?),
            launcher: Arc::new(SystemToolLauncher::new(Duration::from_secs(
                config.process_stop_timeout_secs,
            ))),
            probe: Arc::new(SysinfoProbe::new()),
            sessions: SessionStore::new(),
        })
    }
}

/// Catalog entry plus its on-disk and in-flight state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub id: String,
    pub name: String,
    pub filename: String,
    pub size_gb: f64,
    pub is_downloaded: bool,
    pub is_downloading: bool,
    pub file_path: Option<String>,
    /// Last reported percent of the live session, 0 when idle
    pub progress: u8,
}

/// Snapshot for the health probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub active_downloads: usize,
    pub available_ram_gb: f64,
}

/// Owns the catalog and the session store; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Catalog,
    sessions: SessionStore,
    probe: Arc<dyn SystemProbe>,
    memory: MemoryStrategy,
    tools: ExternalToolStrategy,
    settings: DownloadSettings,
}

impl Orchestrator {
    pub fn new(catalog: Catalog, settings: DownloadSettings, deps: OrchestratorDeps) -> Self {
        let tools = ExternalToolStrategy::new(
            deps.launcher,
            settings.tools.clone(),
            settings.poll_interval,
        );

        Self {
            inner: Arc::new(Inner {
                catalog,
                sessions: deps.sessions,
                probe: deps.probe,
                memory: MemoryStrategy::new(deps.fetcher),
                tools,
                settings,
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Every catalog entry in catalog order
    pub fn list_artifacts(&self) -> Vec<ArtifactStatus> {
        self.inner
            .catalog
            .iter()
            .map(|artifact| self.inner.artifact_status(artifact))
            .collect()
    }

    pub fn status(&self, id: &str) -> DownloadResult<ArtifactStatus> {
        let artifact = self.inner.lookup(id)?;
        Ok(self.inner.artifact_status(artifact))
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            active_downloads: self.inner.sessions.len(),
            available_ram_gb: self.inner.probe.available_memory_gb(),
        }
    }

    /// Start downloading `id`, returning the invocation's event stream
    ///
    /// Rejections (invalid id, unknown id, download already running) and the
    /// already-downloaded short circuit are single-event streams; nothing is
    /// spawned for them. Otherwise the session is registered before this
    /// returns, so a concurrent second call is rejected immediately.
    pub fn download(&self, id: &str) -> EventStream {
        match self.begin(id) {
            Ok(Begin::AlreadyDownloaded) => {
                tracing::info!(artifact = %id, "Artifact already downloaded");
                single_event(DownloadEvent::already_downloaded())
            }
            Ok(Begin::Started(artifact, guard)) => {
                let (tx, rx) = mpsc::channel(self.inner.settings.event_buffer);
                let events = EventSink::new(tx, guard.session().cancel_token().clone());

                metrics::record_download_started(&artifact.id);
                metrics::update_active_downloads(self.inner.sessions.len());

                let inner = self.inner.clone();
                tokio::spawn(async move {
                    inner.run_session(artifact, guard, events).await;
                });

                ReceiverStream::new(rx)
            }
            Err(e) => {
                tracing::warn!(artifact = %id, error = %e, "Download rejected");
                single_event(DownloadEvent::error(&e))
            }
        }
    }

    fn begin(&self, id: &str) -> DownloadResult<Begin> {
        let artifact = self.inner.lookup(id)?;

        if self.inner.sessions.contains(id) {
            return Err(DownloadError::AlreadyInProgress(id.to_string()));
        }

        if self.inner.catalog.final_path(artifact).exists() {
            return Ok(Begin::AlreadyDownloaded);
        }

        let session = DownloadSession::new(
            id,
            self.inner.catalog.settings().stall_timeout,
            self.inner.catalog.temp_path(artifact),
        );
        let guard = self.inner.sessions.try_begin(session)?;

        Ok(Begin::Started(artifact.clone(), guard))
    }

    /// Request cancellation of a live download
    ///
    /// Returns false when no session exists for `id`. Otherwise waits up to
    /// the grace period for the session to end, then removes orphaned scratch
    /// files, leaving those of other live sessions alone.
    pub async fn cancel(&self, id: &str) -> bool {
        if !valid_artifact_id(id) {
            return false;
        }

        let Some(session) = self.inner.sessions.get(id) else {
            return false;
        };
        self.inner.sessions.request_cancel(id);

        tracing::info!(artifact = %id, "Cancellation requested");

        let ended = tokio::time::timeout(self.inner.settings.cancel_grace, async {
            while self.inner.sessions.contains(id) {
                tokio::time::sleep(CANCEL_POLL).await;
            }
        })
        .await
        .is_ok();

        if !ended {
            tracing::warn!(
                artifact = %id,
                grace_ms = self.inner.settings.cancel_grace.as_millis() as u64,
                "Session still winding down after grace period"
            );
        }

        self.inner.sweep_temp_dir(&session).await;
        true
    }

    /// Cancel every live download, returning how many were cancelled
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .list_artifacts()
            .into_iter()
            .filter(|a| a.is_downloading)
            .map(|a| a.id)
            .collect();

        let results = futures::future::join_all(ids.iter().map(|id| {
            tracing::info!(artifact = %id, "Cancelling download for shutdown");
            self.cancel(id)
        }))
        .await;

        results.into_iter().filter(|cancelled| *cancelled).count()
    }
}

enum Begin {
    AlreadyDownloaded,
    Started(ArtifactDescriptor, SessionGuard),
}

impl Inner {
    fn lookup(&self, id: &str) -> DownloadResult<&ArtifactDescriptor> {
        if !valid_artifact_id(id) {
            return Err(DownloadError::InvalidInput(format!("invalid artifact id: {id:?}")));
        }
        self.catalog
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    fn artifact_status(&self, artifact: &ArtifactDescriptor) -> ArtifactStatus {
        let final_path = self.catalog.final_path(artifact);
        let is_downloaded = final_path.exists();
        let session = self.sessions.get(&artifact.id);

        ArtifactStatus {
            id: artifact.id.clone(),
            name: artifact.name.clone(),
            filename: artifact.filename.clone(),
            size_gb: artifact.size_gb,
            is_downloaded,
            is_downloading: session.is_some(),
            file_path: is_downloaded.then(|| final_path.to_string_lossy().into_owned()),
            progress: session.map(|s| s.progress()).unwrap_or(0),
        }
    }

    async fn run_session(
        self: Arc<Self>,
        artifact: ArtifactDescriptor,
        guard: SessionGuard,
        events: EventSink,
    ) {
        let session = guard.session().clone();
        let temp_file = self.catalog.temp_path(&artifact);
        let final_file = self.catalog.final_path(&artifact);
        // Last line of defence for the scratch file, including on panic
        let scratch = TempFileGuard::new(&temp_file);

        let job = TransferJob {
            artifact: &artifact,
            session: &session,
            events: &events,
            temp_file: &temp_file,
            final_file: &final_file,
            allowed_domains: &self.catalog.settings().allowed_domains,
        };

        events
            .emit(DownloadEvent::Started {
                model_id: artifact.id.clone(),
                model_name: artifact.name.clone(),
            })
            .await;

        let outcome = self.transfer(&job).await;

        // Clean up and end the session before the terminal event goes out
        drop(scratch);
        drop(guard);
        metrics::update_active_downloads(self.sessions.len());

        let terminal = match outcome {
            Ok(method) => {
                tracing::info!(
                    artifact = %artifact.id,
                    method = %method,
                    elapsed_secs = session.elapsed().as_secs_f64(),
                    "Download completed"
                );
                metrics::record_download_completed(&artifact.id, &method);
                DownloadEvent::completed(method)
            }
            Err(AttemptError::Cancelled) => {
                tracing::info!(artifact = %artifact.id, "Download cancelled");
                metrics::record_download_cancelled(&artifact.id);
                DownloadEvent::Cancelled
            }
            Err(e) => {
                tracing::error!(artifact = %artifact.id, reason = e.reason(), "All methods failed");
                metrics::record_download_failed(&artifact.id);
                DownloadEvent::error(&DownloadError::from(e))
            }
        };

        events.emit_terminal(terminal).await;
    }

    /// Returns the method that produced the final file
    async fn transfer(&self, job: &TransferJob<'_>) -> Result<String, AttemptError> {
        let artifact = job.artifact;
        let available_gb = self.probe.available_memory_gb();
        let headroom_gb = self.catalog.settings().ram_threshold_gb;

        if memory_eligible(available_gb, artifact.size_gb, headroom_gb)
            && artifact.memory_urls().next().is_some()
        {
            tracing::info!(
                artifact = %artifact.id,
                available_gb,
                size_gb = artifact.size_gb,
                "Using in-memory download"
            );
            job.events.emit(DownloadEvent::info("RAM download")).await;

            match self.memory.run(job).await {
                Ok(()) => return Ok(MEMORY_METHOD.to_string()),
                Err(AttemptError::Cancelled) => return Err(AttemptError::Cancelled),
                Err(e) => {
                    tracing::info!(
                        artifact = %artifact.id,
                        reason = e.reason(),
                        "In-memory download exhausted, falling back to external tools"
                    );
                }
            }
        } else {
            tracing::debug!(
                artifact = %artifact.id,
                available_gb,
                size_gb = artifact.size_gb,
                headroom_gb,
                "Not enough memory for in-memory download"
            );
        }

        job.events
            .emit(DownloadEvent::info("Traditional download"))
            .await;

        let candidates = artifact.tool_candidates();
        let total = candidates.len();

        for_each_candidate(&candidates, job.session.cancel_token(), |i, candidate| {
            self.try_candidate(job, i + 1, total, candidate)
        })
        .await
    }

    /// One candidate with bounded retries
    async fn try_candidate(
        &self,
        job: &TransferJob<'_>,
        index: usize,
        total: usize,
        candidate: &ToolCandidate,
    ) -> Result<String, AttemptError> {
        let method = candidate.method;
        job.events
            .emit(DownloadEvent::info(format!("Method {index}/{total}: {method}")))
            .await;

        if !valid_url(&candidate.url, job.allowed_domains) {
            tracing::warn!(
                artifact = %job.artifact.id,
                method = %method,
                url = %candidate.url,
                "URL rejected by allow-list"
            );
            job.events
                .emit(DownloadEvent::warning(format!(
                    "Skipping {method}: URL not allowed"
                )))
                .await;
            return Err(AttemptError::Skipped("url not allowed".to_string()));
        }

        let policy = self.settings.retry;
        let max_attempts = policy.max_attempts.max(1);

        let result = with_retries(&policy, job.session.cancel_token(), move |attempt| async move {
            if attempt > 1 {
                job.events
                    .emit(DownloadEvent::info(format!("Attempt {attempt}/{max_attempts}")))
                    .await;
            }

            let result = self.tools.attempt(job, candidate).await;

            if let Err(e) = &result
                && *e != AttemptError::Cancelled
            {
                tracing::warn!(
                    artifact = %job.artifact.id,
                    method = %method,
                    attempt,
                    error = %e,
                    "Attempt failed"
                );
                metrics::record_attempt_failure(&job.artifact.id, method.as_str(), e.reason());
            }

            result
        })
        .await;

        match result {
            Ok(()) => Ok(method.to_string()),
            Err(AttemptError::Cancelled) => Err(AttemptError::Cancelled),
            Err(e) => {
                job.events
                    .emit(DownloadEvent::warning(format!("{method} failed: {e}")))
                    .await;
                Err(e)
            }
        }
    }

    /// Remove `*.tmp` files in the temp directory not owned by another live session
    async fn sweep_temp_dir(&self, cancelled: &Arc<DownloadSession>) {
        let temp_dir = &self.catalog.settings().temp_path;
        let mut live = self.sessions.live_temp_files();
        // A new session for the same id may already own the path again
        let restarted = self
            .sessions
            .get(cancelled.artifact_id())
            .is_some_and(|current| !Arc::ptr_eq(&current, cancelled));
        if !restarted {
            live.remove(cancelled.temp_file());
        }

        let mut entries = match tokio::fs::read_dir(temp_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = ?temp_dir, error = %e, "Failed to read temp directory");
                return;
            }
        };

        let mut removed = 0usize;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = ?temp_dir, error = %e, "Failed to list temp directory");
                    break;
                }
            };

            let path: PathBuf = entry.path();
            if path.extension().is_none_or(|ext| ext != "tmp") || live.contains(&path) {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove scratch file"),
            }
        }

        if removed > 0 {
            tracing::info!(dir = ?temp_dir, removed, "Removed orphaned scratch files");
        }
    }
}
