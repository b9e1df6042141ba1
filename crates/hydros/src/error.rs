//! Error types for the reconciliation engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::secrets::SecretError;

/// Errors that can occur during one reconcile pass.
#[derive(Error, Debug)]
pub enum HydrosError {
    #[error("Failed to read directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Failed to serialize YAML: {0}")]
    SerializeYaml(String),

    #[error("Invalid resource in '{path}': {message}")]
    InvalidResource { path: PathBuf, message: String },

    #[error("Invalid API version '{version}', expected '{expected}'")]
    InvalidApiVersion { version: String, expected: String },

    #[error("Duplicate resource name '{name}' for kind '{kind}'")]
    DuplicateName { kind: String, name: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid image reference '{0}'")]
    InvalidImageRef(String),

    #[error("Failed to resolve {} image(s): {}", failures.len(), failures.join("; "))]
    ImageResolution { failures: Vec<String> },

    #[error("Strategy '{strategy}' is not supported for registry '{registry}'")]
    UnsupportedStrategy { strategy: String, registry: String },

    #[error("No resolver configured for registry '{0}'")]
    NoResolver(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Path '{path}' is not of the expected shape: {message}")]
    TargetPath { path: PathBuf, message: String },

    #[error("Hydrated directory '{dir}' is written by both '{first}' and '{second}'")]
    OverlayCollision {
        dir: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Pull request #{number} ({url}) is still open; refusing to hydrate")]
    PullRequestBlocked { number: u64, url: String },

    #[error("Pull request #{number} ({url}) was not merged within {timeout_secs}s")]
    PullRequestNotMerged {
        number: u64,
        url: String,
        timeout_secs: u64,
    },

    #[error("{} of {} reconcile(s) failed: {}", failures.len(), total, failures.join("; "))]
    Reconcile { total: usize, failures: Vec<String> },

    #[error("Hosting platform error: {0}")]
    Platform(String),

    #[error("Build tool '{command}' failed: {message}")]
    BuildTool { command: String, message: String },

    #[error("Command '{command}' timed out after {secs}s")]
    ProcessTimeout { command: String, secs: u64 },

    #[error("Image build failed: {0}")]
    ImageBuild(String),

    #[error("Function '{path}' failed: {message}")]
    Function { path: PathBuf, message: String },

    #[error("File operation failed: {0}")]
    FileOperation(String),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git merge conflict: {0}")]
    GitMergeConflict(String),

    #[error("Git repository not initialized at '{0}'")]
    GitNotInitialized(PathBuf),

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),
}

impl From<serde_yaml::Error> for HydrosError {
    fn from(err: serde_yaml::Error) -> Self {
        HydrosError::ParseYaml {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for HydrosError {
    fn from(err: std::io::Error) -> Self {
        HydrosError::FileOperation(err.to_string())
    }
}

impl HydrosError {
    /// Returns true if the error is likely transient and a later pass may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HydrosError::GitNetworkError(_)
                | HydrosError::GitTimeout(_)
                | HydrosError::ProcessTimeout { .. }
                | HydrosError::PullRequestBlocked { .. }
        )
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> HydrosError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return HydrosError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("merge conflict") || lower.contains("conflict") && lower.contains("merge") {
        return HydrosError::GitMergeConflict(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return HydrosError::GitAuthFailed(stderr.trim().to_string());
    }

    HydrosError::GitOperation(stderr.trim().to_string())
}

/// Errors raised by the reconciliation manager itself, never by a pass.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("A reconciler named '{0}' is already registered")]
    DuplicateName(String),

    #[error("No reconciler named '{0}' is registered")]
    UnknownName(String),

    #[error("Work queue is shut down")]
    ShutDown,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Manager is already running")]
    AlreadyStarted,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, HydrosError>;
