//! Configuration Management
//!
//! Engine settings, loaded once at startup and passed explicitly to the
//! fetcher, filters and actions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_METRICS_CHUNK_SIZE: usize = 50;
pub const DEFAULT_METRICS_WORKERS: usize = 3;
pub const DEFAULT_ACTION_CHUNK_SIZE: usize = 20;
pub const DEFAULT_HYDRATION_WORKERS: usize = 3;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

fn default_metrics_chunk_size() -> usize {
    DEFAULT_METRICS_CHUNK_SIZE
}

fn default_metrics_workers() -> usize {
    DEFAULT_METRICS_WORKERS
}

fn default_action_chunk_size() -> usize {
    DEFAULT_ACTION_CHUNK_SIZE
}

fn default_hydration_workers() -> usize {
    DEFAULT_HYDRATION_WORKERS
}

fn default_call_timeout() -> Option<u64> {
    Some(DEFAULT_CALL_TIMEOUT_SECS)
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// GCP project to query
    #[serde(default)]
    pub project_id: Option<String>,
    /// GCP zone to query ("all" uses aggregated listings)
    #[serde(default)]
    pub zone: Option<String>,
    /// Resources per metrics chunk
    #[serde(default = "default_metrics_chunk_size")]
    pub metrics_chunk_size: usize,
    /// Concurrent metrics chunks
    #[serde(default = "default_metrics_workers")]
    pub metrics_workers: usize,
    /// Default resources per action chunk
    #[serde(default = "default_action_chunk_size")]
    pub action_chunk_size: usize,
    /// Concurrent permission hydration calls
    #[serde(default = "default_hydration_workers")]
    pub hydration_workers: usize,
    /// Per provider call timeout; `null` waits forever
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: Option<u64>,
    /// Extra resource definition files merged over the built-in ones
    #[serde(default)]
    pub resource_files: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            zone: None,
            metrics_chunk_size: DEFAULT_METRICS_CHUNK_SIZE,
            metrics_workers: DEFAULT_METRICS_WORKERS,
            action_chunk_size: DEFAULT_ACTION_CHUNK_SIZE,
            hydration_workers: DEFAULT_HYDRATION_WORKERS,
            call_timeout_secs: Some(DEFAULT_CALL_TIMEOUT_SECS),
            resource_files: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("resfilter").join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_json(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Get effective project (CLI > config > gcloud default)
    pub fn effective_project(&self) -> String {
        self.project_id
            .clone()
            .or_else(crate::provider::gcp::auth::get_default_project)
            .unwrap_or_default()
    }

    /// Get effective zone (CLI > config > gcloud default)
    pub fn effective_zone(&self) -> String {
        self.zone
            .clone()
            .or_else(crate::provider::gcp::auth::get_default_zone)
            .unwrap_or_else(|| "us-central1-a".to_string())
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = EngineConfig::from_json(r#"{"project_id": "my-project"}"#).unwrap();
        assert_eq!(config.project_id.as_deref(), Some("my-project"));
        assert_eq!(config.metrics_chunk_size, 50);
        assert_eq!(config.metrics_workers, 3);
        assert_eq!(config.action_chunk_size, 20);
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_null_timeout_disables_deadline() {
        let config = EngineConfig::from_json(r#"{"call_timeout_secs": null}"#).unwrap();
        assert!(config.call_timeout().is_none());
    }

    #[test]
    fn test_effective_project_prefers_explicit() {
        let config = EngineConfig {
            project_id: Some("explicit-project".to_string()),
            ..Default::default()
        };
        assert_eq!(config.effective_project(), "explicit-project");
    }
}
