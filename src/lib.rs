pub mod api;
pub mod commit;
pub mod error;
pub mod job;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod snapshot;
pub mod verifier;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::error::CiError;
use crate::job::JobStore;
use crate::notify::Notifier;
use crate::snapshot::RepositorySnapshotter;

const DEFAULT_MAX_JOBS: usize = 24;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BUILD_DIR_NAME: &str = "ci-builds";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CIConfig {
    pub max_jobs: Option<usize>,
    pub cleanup_workspaces: Option<bool>,
    pub with_webhook_secret: Option<bool>,
    pub webhook_secret: Option<String>,
    pub build: BuildConfig,
    pub logging: LoggingConfig,
    /// SMTP delivery of build results; results are only logged without it.
    pub notify: Option<NotifyConfig>,
}

impl CIConfig {
    pub fn max_jobs(&self) -> usize {
        self.max_jobs.unwrap_or(DEFAULT_MAX_JOBS)
    }

    /// Returns true if the build directory of a commit is deleted once its job finishes.
    pub fn cleanup_workspaces(&self) -> bool {
        self.cleanup_workspaces.unwrap_or(false)
    }

    /// Returns true if webhook secret validation should be enforced.
    pub fn needs_webhook_secret(&self) -> bool {
        self.with_webhook_secret.unwrap_or(false)
    }

    /// Returns true if a valid (non-empty) webhook_secret is set.
    pub fn has_valid_secret(&self) -> bool {
        self.webhook_secret
            .as_ref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

/// How commits are materialized, compiled and tested.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BuildConfig {
    /// Directory holding one `build-<commit>` folder per snapshot.
    /// Defaults to `ci-builds` under the platform temp directory.
    pub base_dir: Option<PathBuf>,
    /// Manifest file that must exist at a workspace root.
    pub build_descriptor: String,
    pub compile_command: String,
    pub test_command: String,
    /// Regex matched against test output; the `path` group names the report directory.
    pub report_dir_pattern: String,
    /// Report directory, relative to the workspace, used when the test
    /// command never announces one.
    pub fallback_report_dir: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            build_descriptor: "pom.xml".to_string(),
            compile_command: "mvn compile".to_string(),
            test_command: "mvn test".to_string(),
            report_dir_pattern: r"(?P<tool>\S+) report directory: (?P<path>.+)".to_string(),
            fallback_report_dir: None,
        }
    }
}

impl BuildConfig {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_BUILD_DIR_NAME))
    }
}

/// SMTP relay used to mail build results to committers (STARTTLS).
#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    pub host: String,
    pub port: Option<u16>,
    /// Sender address, e.g. `CI <ci@example.com>`.
    pub from: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl NotifyConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SMTP_PORT)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_SMTP_TIMEOUT_SECS)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enables rolling file logs in this directory.
    pub log_dir: Option<PathBuf>,
    /// One of `minutely`, `hourly`, `daily` or `never`.
    pub rotation: Option<String>,
}

/// Load and parse the configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<CIConfig, CiError> {
    let path = path.as_ref();
    let config_str = std::fs::read_to_string(path).map_err(|e| {
        CiError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
    })?;

    let config: CIConfig = toml::from_str(&config_str).map_err(|e| {
        CiError::ConfigError(format!("Failed to parse config file {:?}: {}", path, e))
    })?;

    Ok(config)
}

pub struct AppState {
    pub config: CIConfig,
    pub snapshotter: RepositorySnapshotter,
    pub job_store: Mutex<JobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: CIConfig, notifier: Arc<dyn Notifier>) -> Self {
        let snapshotter = RepositorySnapshotter::new(
            config.build.base_dir(),
            config.build.build_descriptor.clone(),
        );
        let job_store = Mutex::new(JobStore::new(config.max_jobs()));

        Self {
            config,
            snapshotter,
            job_store,
            notifier,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;
