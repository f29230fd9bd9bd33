use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::LoggingConfig;
use crate::error::CiError;

const LOG_FILE_PREFIX: &str = "ci_logs";
const DEFAULT_FILTER: &str = "info";

/// Parses a rotation name from the config file.
pub fn parse_rotation(name: &str) -> Option<Rotation> {
    match name.trim().to_ascii_lowercase().as_str() {
        "minutely" => Some(Rotation::MINUTELY),
        "hourly" => Some(Rotation::HOURLY),
        "daily" => Some(Rotation::DAILY),
        "never" => Some(Rotation::NEVER),
        _ => None,
    }
}

pub struct FileLogger {
    log_directory: PathBuf,
    rotation: Rotation,
}

impl FileLogger {
    pub fn new(log_directory: PathBuf) -> Self {
        Self {
            log_directory,
            rotation: Rotation::DAILY,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Builds the file logger described by `config`, if file logging is enabled.
    pub fn from_config(config: &LoggingConfig) -> Result<Option<Self>, CiError> {
        let Some(dir) = &config.log_dir else {
            return Ok(None);
        };

        let mut logger = Self::new(dir.clone());
        if let Some(name) = &config.rotation {
            let rotation = parse_rotation(name).ok_or_else(|| {
                CiError::ConfigError(format!(
                    "Unknown log rotation '{}'. Use: minutely, hourly, daily, never",
                    name
                ))
            })?;
            logger = logger.with_rotation(rotation);
        }
        Ok(Some(logger))
    }

    pub fn log_directory(&self) -> &PathBuf {
        &self.log_directory
    }

    pub fn setup_file_logging(&self) -> Result<(NonBlocking, WorkerGuard), CiError> {
        // Ensure log directory exists
        std::fs::create_dir_all(&self.log_directory)?;

        let file_appender = RollingFileAppender::new(
            self.rotation.clone(),
            &self.log_directory,
            LOG_FILE_PREFIX,
        );

        Ok(tracing_appender::non_blocking(file_appender))
    }
}

/// Installs the global subscriber: console output plus optional rolling file logs.
///
/// The returned guard must be kept alive for file logs to be flushed.
pub fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, CiError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, guard) = match FileLogger::from_config(config)? {
        Some(logger) => {
            let (writer, guard) = logger.setup_file_logging()?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false); // Disable ANSI colors for file logs
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer()) // Console output
        .with(file_layer)
        .try_init()
        .map_err(|e| CiError::ConfigError(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}
