//! Transfer strategies: buffered in-memory fetch and external downloader processes

pub mod memory;
pub mod tool;

pub use memory::{HttpFetcher, MemoryFetcher, MemoryStrategy, memory_eligible};
pub use tool::{
    ExternalToolStrategy, LaunchSpec, ProcessExit, SystemToolLauncher, ToolLauncher, ToolProcess,
    build_args,
};

use crate::catalog::ArtifactDescriptor;
use crate::events::EventSink;
use crate::session::DownloadSession;
use std::path::{Path, PathBuf};

/// Everything a strategy needs to move one artifact into place
pub struct TransferJob<'a> {
    pub artifact: &'a ArtifactDescriptor,
    pub session: &'a DownloadSession,
    pub events: &'a EventSink,
    pub temp_file: &'a Path,
    pub final_file: &'a Path,
    pub allowed_domains: &'a [String],
}

/// Removes a scratch file when dropped unless it was committed
///
/// Committing renames the scratch file onto its destination, which is the
/// only way a final file is ever created.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the scratch file to `dest`
    pub async fn commit(mut self, dest: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = ?self.path, "Removed scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = ?self.path, error = %e, "Failed to remove scratch file"),
        }
    }
}
