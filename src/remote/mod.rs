//! Remote command execution on workers.
//!
//! A [`RemoteTransport`] opens one [`RemoteSession`] per worker address. The
//! [`RemoteExecutor`] wraps a session with the error-stream contract and
//! the background-and-poll workaround for long-running commands, so callers
//! never hold a channel open while a remote process runs.

pub mod executor;
pub mod ssh;

use std::path::Path;

use async_trait::async_trait;

use crate::error::RemoteError;

pub use executor::{shell_quote, PollOptions, RemoteExecutor};
pub use ssh::{SshOptions, SshTransport};

/// Captured output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Whether the command wrote anything to its error stream.
    pub fn has_errors(&self) -> bool {
        !self.stderr.trim().is_empty()
    }
}

/// An open connection to one worker.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command and capture its output.
    async fn run(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Copy a local file to the worker.
    async fn put(&self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    /// Copy a file from the worker.
    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&self) -> Result<(), RemoteError>;
}

/// Factory for sessions.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, RemoteError>;
}
