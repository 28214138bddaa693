//! CLI configuration.
//!
//! Read from `~/.config/batchpull/config.json` (or `--config`), then
//! overridden by environment variables, then by command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use batchpull_executor::{Aria2cOptions, ExecutorConfig, ServiceConfig};
use batchpull_inventory::{AnalyzeOptions, DEFAULT_ENDPOINT};
use batchpull_model::{DEFAULT_SAFETY_MARGIN, SafetyMargin};
use batchpull_transfer::MovedFilesPolicy;
use serde::{Deserialize, Serialize};

pub const ENV_METADATA_DIR: &str = "BATCHPULL_METADATA_DIR";
pub const ENV_DOWNLOADS_DIR: &str = "BATCHPULL_DOWNLOADS_DIR";
pub const ENV_ENDPOINT: &str = "HF_ENDPOINT";
pub const ENV_TOKEN: &str = "HF_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub sample_size: usize,
    pub timeout_secs: u64,
    pub large_collection_threshold: usize,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        let defaults = AnalyzeOptions::default();
        Self {
            sample_size: defaults.sample_size,
            timeout_secs: defaults.timeout.as_secs(),
            large_collection_threshold: defaults.large_collection_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub poll_interval_secs: u64,
    pub monitor_join_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            monitor_join_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub metadata_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub endpoint: String,
    /// Bearer token for gated collections. Never written back to disk.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub safety_margin: f64,
    pub moved_files_policy: MovedFilesPolicy,
    /// Minimum free space a download directory must have, in MiB.
    pub min_free_space_mb: u64,
    pub request_timeout_secs: u64,
    pub analysis: AnalysisSection,
    pub executor: ExecutorSection,
    pub agent: Aria2cOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("metadata"),
            downloads_dir: PathBuf::from("downloads"),
            endpoint: DEFAULT_ENDPOINT.into(),
            token: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            moved_files_policy: MovedFilesPolicy::Skip,
            min_free_space_mb: 100,
            request_timeout_secs: 30,
            analysis: AnalysisSection::default(),
            executor: ExecutorSection::default(),
            agent: Aria2cOptions::default(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. So does an unparsable one, with a
    /// warning, so a broken config never blocks `status` or `cancel`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "configuration loaded");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Applies environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = set(ENV_METADATA_DIR) {
            self.metadata_dir = dir.into();
        }
        if let Some(dir) = set(ENV_DOWNLOADS_DIR) {
            self.downloads_dir = dir.into();
        }
        if let Some(endpoint) = set(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(token) = set(ENV_TOKEN) {
            self.token = Some(token);
        }
    }

    /// Validates and converts into the service configuration.
    pub fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let safety_margin =
            SafetyMargin::new(self.safety_margin).context("invalid safety_margin in config")?;
        Ok(ServiceConfig {
            metadata_dir: self.metadata_dir.clone(),
            downloads_dir: self.downloads_dir.clone(),
            safety_margin,
            analyze: AnalyzeOptions {
                quick: false,
                sample_size: self.analysis.sample_size.max(1),
                timeout: Duration::from_secs(self.analysis.timeout_secs.max(1)),
                large_collection_threshold: self.analysis.large_collection_threshold,
            },
            executor: ExecutorConfig {
                poll_interval: Duration::from_secs(self.executor.poll_interval_secs.max(1)),
                monitor_join_timeout: Duration::from_secs(self.executor.monitor_join_timeout_secs),
                moved_files_policy: self.moved_files_policy,
            },
            min_free_space: self.min_free_space_mb * 1024 * 1024,
        })
    }

    pub fn agent_options(&self) -> Aria2cOptions {
        Aria2cOptions {
            auth_token: self.token.clone(),
            ..self.agent.clone()
        }
    }
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("batchpull").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(xdg));
        }
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config"))
    }

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join("Library").join("Application Support"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").context("APPDATA is not set")?;
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&tmp.path().join("nope.json"))).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.safety_margin, 0.9);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"safety_margin": 0.8, "moved_files_policy": "redownload", "agent": {"split": 2}}"#,
        )
        .unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.safety_margin, 0.8);
        assert_eq!(config.moved_files_policy, MovedFilesPolicy::Redownload);
        assert_eq!(config.agent.split, 2);
        assert_eq!(config.agent.max_concurrent_downloads, 8);
        assert_eq!(config.analysis, AnalysisSection::default());
    }

    #[test]
    fn garbage_file_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(AppConfig::load(Some(&path)).unwrap(), AppConfig::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_METADATA_DIR, "/var/lib/batchpull"),
            (ENV_ENDPOINT, "https://huggingface.co"),
            (ENV_TOKEN, "hf_abc"),
            (ENV_DOWNLOADS_DIR, "  "),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.metadata_dir, PathBuf::from("/var/lib/batchpull"));
        assert_eq!(config.downloads_dir, PathBuf::from("downloads"));
        assert_eq!(config.endpoint, "https://huggingface.co");
        assert_eq!(config.agent_options().auth_token.as_deref(), Some("hf_abc"));
    }

    #[test]
    fn token_is_not_serialized() {
        let config = AppConfig {
            token: Some("secret".into()),
            ..AppConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn service_config_rejects_bad_margin() {
        let config = AppConfig {
            safety_margin: 1.5,
            ..AppConfig::default()
        };
        assert!(config.service_config().is_err());

        let service = AppConfig::default().service_config().unwrap();
        assert_eq!(service.min_free_space, 100 * 1024 * 1024);
        assert_eq!(service.executor.poll_interval, Duration::from_secs(5));
        assert_eq!(service.analyze.timeout, Duration::from_secs(30));
    }
}
