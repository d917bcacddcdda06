//! Running one fire on one worker.
//!
//! ```text
//! Job + Worker → JobRunner → remote dir → docker bsp → output.json → published artifacts
//! ```
//!
//! The runner:
//! 1. Publishes the job's input and marks the run `running`
//! 2. Prepares a working directory on the worker and writes config and input
//! 3. Makes sure docker and the bluesky image are present
//! 4. Runs the pipeline detached and polls until it exits
//! 5. Publishes the log and the exported output bundle
//! 6. Records exactly one terminal status and releases the worker

pub mod bluesky;
pub mod job;
pub mod job_runner;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::{RemoteError, StorageError};

pub use bluesky::{container_name, export_config, merge_config, pipeline_command, PipelineSpec};
pub use job::Job;
pub use job_runner::{JobReport, JobRunner, RunContext};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not determine home directory on {0}")]
    MissingHomeDir(String),

    #[error("'{0}' is not available on the worker")]
    DependencyMissing(String),

    #[error("Invalid bluesky output: {0}")]
    InvalidOutput(String),

    #[error("Invalid bluesky config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
