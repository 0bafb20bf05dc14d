//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    /// Candidate catalog files, first existing one wins
    pub catalog_paths: Vec<PathBuf>,
    /// Poll tick for cancellation and stall checks while a transfer runs
    pub poll_interval_ms: u64,
    /// Attempts per source candidate
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    /// How long `cancel` waits for the attempt to observe the flag
    pub cancel_grace_ms: u64,
    pub memory_fetch_timeout_secs: u64,
    /// Wait between SIGTERM and SIGKILL when stopping a downloader process
    pub process_stop_timeout_secs: u64,
    /// Per-invocation event channel capacity
    pub event_buffer: usize,
    pub tools: ToolPaths,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            catalog_paths: default_catalog_paths(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            memory_fetch_timeout_secs: default_memory_fetch_timeout_secs(),
            process_stop_timeout_secs: default_process_stop_timeout_secs(),
            event_buffer: default_event_buffer(),
            tools: ToolPaths::default(),
        }
    }
}

/// Paths of the external downloader binaries
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    pub wget: String,
    pub curl: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            wget: "wget".to_string(),
            curl: "curl".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("WEIGHTS_MANAGER_API_PORT") {
            config.api_port = port
                .parse()
                .context("Invalid WEIGHTS_MANAGER_API_PORT value")?;
        }
        if let Ok(catalog) = std::env::var("WEIGHTS_MANAGER_CATALOG") {
            config.catalog_paths.insert(0, PathBuf::from(catalog));
        }
        if let Ok(retries) = std::env::var("WEIGHTS_MANAGER_MAX_RETRIES") {
            config.max_retries = retries
                .parse()
                .context("Invalid WEIGHTS_MANAGER_MAX_RETRIES value")?;
        }
        if let Ok(wget) = std::env::var("WEIGHTS_MANAGER_WGET") {
            config.tools.wget = wget;
        }
        if let Ok(curl) = std::env::var("WEIGHTS_MANAGER_CURL") {
            config.tools.curl = curl;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 1000 {
            anyhow::bail!(
                "poll_interval_ms must be between 1 and 1000 (got {})",
                self.poll_interval_ms
            );
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if self.catalog_paths.is_empty() {
            anyhow::bail!("catalog_paths cannot be empty");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

// Default functions
fn default_api_port() -> u16 {
    8080
}
fn default_catalog_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("models.json"),
        PathBuf::from("config/models.json"),
        PathBuf::from("../config/models.json"),
        PathBuf::from("backend/config/models.json"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("weights-manager").join("models.json"));
    }
    paths
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_secs() -> u64 {
    2
}
fn default_cancel_grace_ms() -> u64 {
    500
}
fn default_memory_fetch_timeout_secs() -> u64 {
    3600
}
fn default_process_stop_timeout_secs() -> u64 {
    2
}
fn default_event_buffer() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.tools.curl, "curl");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_validation() {
        let config = ManagerConfig {
            api_port: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_must_be_sub_second() {
        let config = ManagerConfig {
            poll_interval_ms: 5000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ManagerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = ManagerConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ManagerConfig = toml::from_str(
            r#"
            api_port = 9100
            max_retries = 4

            [tools]
            curl = "/usr/local/bin/curl"
            "#,
        )
        .unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.tools.curl, "/usr/local/bin/curl");
        assert_eq!(config.tools.wget, "wget");
        assert_eq!(config.retry_backoff_secs, 2);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(&path, "api_port = 9100\n").unwrap();

        // SAFETY: serialised with other env-mutating tests
        unsafe {
            std::env::set_var("WEIGHTS_MANAGER_API_PORT", "9200");
            std::env::set_var("WEIGHTS_MANAGER_CATALOG", "/etc/weights/models.json");
        }
        let config = ManagerConfig::load(Some(path));
        unsafe {
            std::env::remove_var("WEIGHTS_MANAGER_API_PORT");
            std::env::remove_var("WEIGHTS_MANAGER_CATALOG");
        }

        let config = config.unwrap();
        assert_eq!(config.api_port, 9200);
        assert_eq!(
            config.catalog_paths[0],
            PathBuf::from("/etc/weights/models.json")
        );
    }

    #[test]
    #[serial]
    fn test_invalid_env_override() {
        unsafe {
            std::env::set_var("WEIGHTS_MANAGER_MAX_RETRIES", "many");
        }
        let result = ManagerConfig::load(None);
        unsafe {
            std::env::remove_var("WEIGHTS_MANAGER_MAX_RETRIES");
        }
        assert!(result.is_err());
    }
}
