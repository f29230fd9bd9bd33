use std::io;
use std::path::PathBuf;

/// Custom error type for commit_ci operations
#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("State violation: {0}")]
    StateViolation(String),

    #[error("Process failure: {command}\n{message}")]
    ProcessFailure { command: String, message: String },

    #[error("Failed to parse report {path:?}: {message}")]
    ParseFailure { path: PathBuf, message: String },

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Webhook validation failed: {0}")]
    WebhookValidationFailed(String),

    #[error("Notification failed: {0}")]
    NotificationFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Failures while materializing a commit workspace
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("invalid commit hash '{0}'")]
    InvalidCommitHash(String),

    #[error("failed to prepare build directory {path:?}: {source}")]
    Workspace { path: PathBuf, source: io::Error },

    #[error("git clone of '{url}' failed:\n{message}")]
    Clone { url: String, message: String },

    #[error("branch '{branch}' not found among remote branches (tried {candidates:?})")]
    BranchNotFound {
        branch: String,
        candidates: Vec<String>,
    },

    #[error("git checkout of '{reference}' failed:\n{message}")]
    Checkout { reference: String, message: String },

    #[error("git reset to '{commit}' failed:\n{message}")]
    Reset { commit: String, message: String },

    #[error("no build directory at {0:?}")]
    NotFound(PathBuf),
}

/// Helper type for Results that use CiError
pub type Result<T> = std::result::Result<T, CiError>;
