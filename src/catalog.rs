//! Artifact catalog: descriptors of downloadable weight files and where to get them

use crate::error::{DownloadError, DownloadResult};
use crate::validate::{valid_artifact_id, valid_filename};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// External downloader used for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Wget,
    Curl,
}

impl ToolKind {
    /// Order in which tools are tried for a plain URL
    pub const ALL: [ToolKind; 2] = [ToolKind::Wget, ToolKind::Curl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wget => "wget",
            Self::Curl => "curl",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wget" => Ok(Self::Wget),
            "curl" => Ok(Self::Curl),
            other => Err(DownloadError::InvalidInput(format!(
                "unsupported download method: {other}"
            ))),
        }
    }
}

/// One configured source for an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceCandidate {
    /// Plain URL: eligible for in-memory fetch and tried by every tool
    Direct { url: String },
    /// URL bound to a specific external tool
    Tool { method: ToolKind, url: String },
}

/// A (tool, url) pair the external-tool strategy will attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCandidate {
    pub method: ToolKind,
    pub url: String,
}

/// Immutable description of a downloadable artifact
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDescriptor {
    pub id: String,
    pub name: String,
    pub filename: String,
    pub size_gb: f64,
    pub sources: Vec<SourceCandidate>,
}

impl ArtifactDescriptor {
    /// URLs eligible for the buffered-memory strategy, in catalog order
    pub fn memory_urls(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().filter_map(|source| match source {
            SourceCandidate::Direct { url } => Some(url.as_str()),
            SourceCandidate::Tool { .. } => None,
        })
    }

    /// External-tool candidates in catalog order; plain URLs expand to every tool
    pub fn tool_candidates(&self) -> Vec<ToolCandidate> {
        let mut candidates = Vec::new();
        for source in &self.sources {
            match source {
                SourceCandidate::Direct { url } => {
                    candidates.extend(ToolKind::ALL.iter().map(|method| ToolCandidate {
                        method: *method,
                        url: url.clone(),
                    }));
                }
                SourceCandidate::Tool { method, url } => candidates.push(ToolCandidate {
                    method: *method,
                    url: url.clone(),
                }),
            }
        }
        candidates
    }
}

/// Catalog-wide download settings
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub download_path: PathBuf,
    pub temp_path: PathBuf,
    pub allowed_domains: Vec<String>,
    pub stall_timeout: Duration,
    pub ram_threshold_gb: f64,
}

/// Read-only set of artifacts, in catalog order
#[derive(Debug, Clone)]
pub struct Catalog {
    settings: CatalogSettings,
    artifacts: Vec<ArtifactDescriptor>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    models: Vec<RawModel>,
    download_path: PathBuf,
    temp_path: PathBuf,
    #[serde(default)]
    allowed_domains: Vec<String>,
    #[serde(default = "default_stall_timeout", alias = "stall_timeout")]
    stall_timeout_seconds: u64,
    #[serde(default = "default_ram_threshold_gb")]
    ram_download_threshold_gb: f64,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    id: String,
    name: String,
    filename: String,
    size_gb: f64,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    methods: Vec<RawMethod>,
}

#[derive(Debug, Deserialize)]
struct RawMethod {
    #[serde(rename = "type")]
    kind: String,
    url: String,
}

fn default_stall_timeout() -> u64 {
    120
}
fn default_ram_threshold_gb() -> f64 {
    2.5
}

impl Catalog {
    /// Find the first existing file in `paths` and load it
    pub fn load_from_search_path(paths: &[PathBuf]) -> DownloadResult<(Self, PathBuf)> {
        let Some(path) = paths.iter().find(|p| p.is_file()) else {
            for path in paths {
                tracing::debug!(path = ?path, "Catalog not found");
            }
            return Err(DownloadError::Config(format!(
                "catalog not found in any of {} locations",
                paths.len()
            )));
        };

        let catalog = Self::load(path)?;
        Ok((catalog, path.clone()))
    }

    /// Load a catalog file; `.toml` is parsed as TOML, anything else as JSON
    pub fn load(path: &Path) -> DownloadResult<Self> {
        let content = std::fs::read_to_string(path)?;

        let raw: RawCatalog = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| DownloadError::Config(format!("invalid catalog {path:?}: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| DownloadError::Config(format!("invalid catalog {path:?}: {e}")))?
        };

        let catalog = Self::from_raw(raw)?;

        tracing::info!(
            path = ?path,
            artifacts = catalog.len(),
            "Catalog loaded"
        );

        Ok(catalog)
    }

    fn from_raw(raw: RawCatalog) -> DownloadResult<Self> {
        if !raw.ram_download_threshold_gb.is_finite() || raw.ram_download_threshold_gb < 0.0 {
            return Err(DownloadError::InvalidInput(format!(
                "ram_download_threshold_gb must be non-negative (got {})",
                raw.ram_download_threshold_gb
            )));
        }

        let settings = CatalogSettings {
            download_path: raw.download_path,
            temp_path: raw.temp_path,
            allowed_domains: raw.allowed_domains,
            stall_timeout: Duration::from_secs(raw.stall_timeout_seconds),
            ram_threshold_gb: raw.ram_download_threshold_gb,
        };

        let artifacts = raw
            .models
            .into_iter()
            .map(descriptor_from_raw)
            .collect::<DownloadResult<Vec<_>>>()?;

        Self::new(settings, artifacts)
    }

    /// Build a catalog from already-parsed descriptors, validating each one
    pub fn new(
        settings: CatalogSettings,
        artifacts: Vec<ArtifactDescriptor>,
    ) -> DownloadResult<Self> {
        if settings.stall_timeout.is_zero() {
            return Err(DownloadError::InvalidInput(
                "stall_timeout_seconds must be at least 1".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(artifacts.len());

        for (i, artifact) in artifacts.iter().enumerate() {
            validate_descriptor(artifact)?;
            if index.insert(artifact.id.clone(), i).is_some() {
                return Err(DownloadError::InvalidInput(format!(
                    "duplicate artifact id: {}",
                    artifact.id
                )));
            }
        }

        Ok(Self {
            settings,
            artifacts,
            index,
        })
    }

    /// Create the download and temp directories if absent
    pub fn ensure_dirs(&self) -> DownloadResult<()> {
        for dir in [&self.settings.download_path, &self.settings.temp_path] {
            std::fs::create_dir_all(dir)?;
            tracing::debug!(dir = ?dir, "Directory verified");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ArtifactDescriptor> {
        self.index.get(id).map(|i| &self.artifacts[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.artifacts.iter()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn settings(&self) -> &CatalogSettings {
        &self.settings
    }

    /// Destination of the completed file
    pub fn final_path(&self, artifact: &ArtifactDescriptor) -> PathBuf {
        self.settings.download_path.join(&artifact.filename)
    }

    /// Scratch file used while an attempt is in flight
    pub fn temp_path(&self, artifact: &ArtifactDescriptor) -> PathBuf {
        self.settings
            .temp_path
            .join(format!("{}.tmp", artifact.filename))
    }
}

fn descriptor_from_raw(raw: RawModel) -> DownloadResult<ArtifactDescriptor> {
    let mut sources: Vec<SourceCandidate> = raw
        .urls
        .into_iter()
        .map(|url| SourceCandidate::Direct { url })
        .collect();

    for method in raw.methods {
        sources.push(SourceCandidate::Tool {
            method: method.kind.parse()?,
            url: method.url,
        });
    }

    Ok(ArtifactDescriptor {
        id: raw.id,
        name: raw.name,
        filename: raw.filename,
        size_gb: raw.size_gb,
        sources,
    })
}

fn validate_descriptor(artifact: &ArtifactDescriptor) -> DownloadResult<()> {
    if !valid_artifact_id(&artifact.id) {
        return Err(DownloadError::InvalidInput(format!(
            "invalid artifact id: {:?}",
            artifact.id
        )));
    }
    if !valid_filename(&artifact.filename) {
        return Err(DownloadError::InvalidInput(format!(
            "artifact '{}' has invalid filename {:?}",
            artifact.id, artifact.filename
        )));
    }
    if !artifact.size_gb.is_finite() || artifact.size_gb <= 0.0 {
        return Err(DownloadError::InvalidInput(format!(
            "artifact '{}' size_gb must be positive (got {})",
            artifact.id, artifact.size_gb
        )));
    }
    if artifact.sources.is_empty() {
        return Err(DownloadError::InvalidInput(format!(
            "artifact '{}' has no source candidates",
            artifact.id
        )));
    }
    Ok(())
}
