//! Error types for the collaborator boundaries.
//!
//! Defines the errors raised by the external systems the orchestrator
//! drives:
//! - Remote command execution and file transfer
//! - Instance provisioning, initialization and teardown
//! - Object storage uploads and existence checks
//!
//! Subsystem errors that wrap these (`PoolError`, `RunnerError`,
//! `OrchestratorError`, ...) live next to the code that raises them.

use thiserror::Error;

use crate::fleet::Worker;

/// Errors that can occur while talking to a remote worker.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// The command wrote to its error stream and errors were not ignored.
    #[error("Error running command '{command}': {stderr}")]
    Command { command: String, stderr: String },

    #[error("Failed to copy '{from}' to '{to}': {reason}")]
    TransferFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Gave up after {seconds} seconds waiting for '{marker}' to finish")]
    Timeout { marker: String, seconds: u64 },

    #[error("Interrupted while waiting for '{0}' to finish")]
    Interrupted(String),

    #[error("Invalid process marker '{0}'")]
    InvalidMarker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while provisioning or tearing down instances.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Some instances were created before the launch failed. The created
    /// instances must still be torn down by the caller.
    #[error("Launch failed after creating {} instance(s): {message}", .created.len())]
    Partial {
        created: Vec<Worker>,
        message: String,
    },

    #[error("Instance launch failed: {0}")]
    LaunchFailed(String),

    #[error("Failed to query state of instance '{instance}': {reason}")]
    DescribeFailed { instance: String, reason: String },

    #[error("Failed to shut down instances: {0}")]
    ShutdownFailed(String),

    #[error("Instance initialization failed: {0}")]
    InitializationFailed(String),

    #[error("AWS CLI error: {0}")]
    Cli(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during object storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to upload '{key}' to bucket '{bucket}': {reason}")]
    UploadFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Failed to check existence of '{url}': {reason}")]
    ExistsFailed { url: String, reason: String },

    #[error("Invalid object URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
