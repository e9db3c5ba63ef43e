//! Configuration file format.
//!
//! Every value is optional in the file; `main` merges the file with the
//! command line and the built-in defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pvr-scheduler.toml";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration file format.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default, rename = "recorder")]
    pub recorders: Vec<RecorderSettings>,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub postproc: PostprocSection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchedulerSection {
    pub tick_interval_secs: Option<u64>,
    pub recheck_interval_secs: Option<u64>,
    pub claim_retry_limit: Option<u32>,
    pub claim_retry_backoff_ms: Option<u64>,
    pub lookahead_secs: Option<u64>,
    pub reconcile_interval_secs: Option<u64>,
    pub janitor_interval_secs: Option<u64>,
    pub import_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WatchdogSection {
    pub check_interval_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
}

/// One `[[recorder]]` entry: a tuner device.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RecorderSettings {
    pub title: String,
    pub device_path: PathBuf,
    #[serde(default)]
    pub quick_tunable: bool,
    /// Argument vector run before capture; `{device}` and `{channel}` are substituted.
    #[serde(default)]
    pub tune_command: Option<Vec<String>>,
    #[serde(default)]
    pub allow_channels: Vec<String>,
    #[serde(default)]
    pub deny_channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    #[serde(default)]
    pub recording_dirs: Vec<PathBuf>,
    pub import_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PostprocSection {
    pub ffmpeg: Option<String>,
    pub chapter_tool: Option<String>,
    pub rating_detector: Option<String>,
    pub rating_span_secs: Option<u64>,
    pub default_indexer: Option<String>,
    pub work_dir: Option<PathBuf>,
    /// Upper bound on a single tool run; 0 disables the limit.
    pub tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifySection {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseSection {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

impl ConfigFile {
    /// Parse a config file from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ConfigFile = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut titles = HashSet::new();
        for recorder in &self.recorders {
            if recorder.title.trim().is_empty() {
                return Err(ConfigError::Invalid("recorder title must not be empty".into()));
            }
            if !titles.insert(recorder.title.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate recorder title: {}",
                    recorder.title
                )));
            }
            if let Some(cmd) = &recorder.tune_command {
                if cmd.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "recorder {}: tune_command must not be empty",
                        recorder.title
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    ConfigFile::from_toml(&contents)
}

/// Resolve the config file path: explicit path > auto-detect.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = ConfigFile::from_toml(
            r#"
            [scheduler]
            tick_interval_secs = 30
            claim_retry_limit = 5

            [watchdog]
            check_interval_ms = 500
            failure_threshold = 4

            [[recorder]]
            title = "Tuner A"
            device_path = "/dev/video0"
            allow_channels = ["5", "7"]

            [[recorder]]
            title = "Tuner B"
            device_path = "/dev/video1"
            quick_tunable = true
            tune_command = ["ivtv-tune", "-d", "{device}", "-c", "{channel}"]

            [storage]
            recording_dirs = ["/srv/rec", "/mnt/rec"]

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.tick_interval_secs, Some(30));
        assert_eq!(config.scheduler.recheck_interval_secs, None);
        assert_eq!(config.watchdog.failure_threshold, Some(4));
        assert_eq!(config.recorders.len(), 2);
        assert_eq!(config.recorders[0].allow_channels, vec!["5", "7"]);
        assert!(config.recorders[1].quick_tunable);
        assert_eq!(config.storage.recording_dirs.len(), 2);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = ConfigFile::from_toml("").unwrap();
        assert!(config.recorders.is_empty());
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn test_duplicate_recorder_titles_rejected() {
        let err = ConfigFile::from_toml(
            r#"
            [[recorder]]
            title = "A"
            device_path = "/dev/video0"
            [[recorder]]
            title = "A"
            device_path = "/dev/video1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[database]\npath = \"pvr.db\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.database.path.as_deref(), Some("pvr.db"));
        assert_eq!(resolve_config_path(Some(&path)), Some(path.clone()));
    }
}
