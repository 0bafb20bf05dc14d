//! In-flight download sessions and the keyed store that owns them

use crate::error::{DownloadError, DownloadResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mutable state of one in-flight download
#[derive(Debug)]
pub struct DownloadSession {
    artifact_id: String,
    cancel: CancellationToken,
    progress: AtomicU8,
    started: Instant,
    started_at: DateTime<Utc>,
    stall_timeout: Duration,
    temp_file: PathBuf,
}

impl DownloadSession {
    pub fn new(artifact_id: impl Into<String>, stall_timeout: Duration, temp_file: PathBuf) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            cancel: CancellationToken::new(),
            progress: AtomicU8::new(0),
            started: Instant::now(),
            started_at: Utc::now(),
            stall_timeout,
            temp_file,
        }
    }

    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    /// Token observed by the attempt at every poll tick
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Last reported percent
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    pub(crate) fn record_progress(&self, percent: u8) {
        self.progress.fetch_max(percent.min(100), Ordering::Relaxed);
    }

    /// Time since the session began, on a monotonic clock
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    pub fn temp_file(&self) -> &Path {
        &self.temp_file
    }
}

/// Keyed store of live sessions, at most one per artifact id
///
/// Cloning shares the underlying map. The only mutations are
/// [`SessionStore::try_begin`], the removal performed when the returned
/// [`SessionGuard`] drops, and [`SessionStore::request_cancel`].
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Arc<DownloadSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless one already exists for the same artifact id
    pub fn try_begin(&self, session: DownloadSession) -> DownloadResult<SessionGuard> {
        match self.sessions.entry(session.artifact_id.clone()) {
            Entry::Occupied(entry) => Err(DownloadError::AlreadyInProgress(entry.key().clone())),
            Entry::Vacant(entry) => {
                let session = Arc::new(session);
                entry.insert(session.clone());

                tracing::debug!(artifact = %session.artifact_id, "Session started");

                Ok(SessionGuard {
                    store: self.clone(),
                    session,
                })
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<DownloadSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Set the cancellation flag of a live session; false if none exists
    pub fn request_cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Scratch files currently owned by live sessions
    pub fn live_temp_files(&self) -> HashSet<PathBuf> {
        self.sessions
            .iter()
            .map(|entry| entry.value().temp_file.clone())
            .collect()
    }
}

/// Ownership of a live session; removes it from the store when dropped
#[derive(Debug)]
pub struct SessionGuard {
    store: SessionStore,
    session: Arc<DownloadSession>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<DownloadSession> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self
            .store
            .sessions
            .remove_if(&self.session.artifact_id, |_, live| {
                Arc::ptr_eq(live, &self.session)
            });

        if removed.is_some() {
            tracing::debug!(artifact = %self.session.artifact_id, "Session ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> DownloadSession {
        DownloadSession::new(
            id,
            Duration::from_secs(120),
            PathBuf::from(format!("/tmp/{id}.gguf.tmp")),
        )
    }

    #[test]
    fn test_second_session_rejected() {
        let store = SessionStore::new();
        let _guard = store.try_begin(session("m1")).unwrap();

        let err = store.try_begin(session("m1")).unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyInProgress(id) if id == "m1"));
        assert_eq!(store.len(), 1);

        let _other = store.try_begin(session("m2")).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_guard_drop_removes_session() {
        let store = SessionStore::new();
        {
            let _guard = store.try_begin(session("m1")).unwrap();
            assert!(store.contains("m1"));
        }
        assert!(!store.contains("m1"));
        assert!(store.try_begin(session("m1")).is_ok());
    }

    #[test]
    fn test_cancel_sets_flag_once() {
        let store = SessionStore::new();
        assert!(!store.request_cancel("m1"));

        let guard = store.try_begin(session("m1")).unwrap();
        assert!(!guard.session().is_cancelled());
        assert!(store.request_cancel("m1"));
        assert!(store.request_cancel("m1"));
        assert!(guard.session().is_cancelled());
    }

    #[test]
    fn test_progress_never_decreases() {
        let s = session("m1");
        s.record_progress(40);
        s.record_progress(10);
        assert_eq!(s.progress(), 40);
        s.record_progress(250);
        assert_eq!(s.progress(), 100);
    }

    #[test]
    fn test_live_temp_files() {
        let store = SessionStore::new();
        let _a = store.try_begin(session("a")).unwrap();
        let files = store.live_temp_files();
        assert!(files.contains(&PathBuf::from("/tmp/a.gguf.tmp")));
        assert_eq!(files.len(), 1);
    }
}
