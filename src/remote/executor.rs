//! Command execution against a single worker.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CommandOutput, RemoteSession, RemoteTransport};
use crate::error::RemoteError;
use crate::shutdown::ShutdownToken;

/// How to wait for a backgrounded remote process.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Time between process-list checks.
    pub interval: Duration,
    /// Give up after this long; `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Executes commands on one worker over an open session.
pub struct RemoteExecutor {
    address: String,
    session: Box<dyn RemoteSession>,
}

impl RemoteExecutor {
    /// Open a session to `address`.
    pub async fn connect(
        transport: &dyn RemoteTransport,
        address: &str,
    ) -> Result<Self, RemoteError> {
        let session = transport.connect(address).await?;
        debug!(address = %address, "Connected");
        Ok(Self {
            address: address.to_string(),
            session,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run `command`, failing if it writes to its error stream.
    pub async fn execute(&self, command: &str) -> Result<String, RemoteError> {
        self.execute_with(command, false).await.map(|o| o.stdout)
    }

    /// Run `command`, logging rather than failing on error output.
    pub async fn execute_ignoring_errors(&self, command: &str) -> Result<String, RemoteError> {
        self.execute_with(command, true).await.map(|o| o.stdout)
    }

    /// Run `command`. Error output fails the call unless `ignore_errors` is set,
    /// in which case it is logged and stdout is still returned. Transport
    /// failures are always returned.
    pub async fn execute_with(
        &self,
        command: &str,
        ignore_errors: bool,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(address = %self.address, command = %command, "Executing");
        let output = self.session.run(command).await?;
        if output.has_errors() {
            let stderr = output.stderr.trim().to_string();
            if !ignore_errors {
                return Err(RemoteError::Command {
                    command: command.to_string(),
                    stderr,
                });
            }
            warn!(
                address = %self.address,
                command = %command,
                stderr = %stderr,
                "Ignoring error output"
            );
        }
        Ok(output)
    }

    pub async fn put(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        debug!(address = %self.address, local = %local.display(), remote = %remote, "Uploading");
        self.session.put(local, remote).await
    }

    pub async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        debug!(address = %self.address, remote = %remote, local = %local.display(), "Downloading");
        self.session.get(remote, local).await
    }

    /// Serialize `value` and copy it to `remote`.
    pub async fn write_json(&self, value: &Value, remote: &str) -> Result<(), RemoteError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&serde_json::to_vec_pretty(value)?)?;
        file.flush()?;
        self.put(file.path(), remote).await
    }

    /// Start `command` in the background and poll the process list until no
    /// process mentions `marker`.
    ///
    /// Reading the output of a long-running command can block the channel
    /// indefinitely, so the command is detached and its completion inferred
    /// from the marker disappearing. `command` must include `marker` in its
    /// own arguments.
    pub async fn run_detached(
        &self,
        command: &str,
        marker: &str,
        poll: PollOptions,
        shutdown: &ShutdownToken,
    ) -> Result<(), RemoteError> {
        validate_marker(marker)?;

        let launch = format!("nohup sh -c {} > /dev/null 2>&1 &", shell_quote(command));
        self.execute(&launch).await?;

        let check = format!(
            "ps -eo args | grep -F -- {} | grep -v grep || true",
            shell_quote(marker)
        );
        let started = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(RemoteError::Interrupted(marker.to_string()));
                }
                _ = tokio::time::sleep(poll.interval) => {}
            }

            let listing = self.execute_ignoring_errors(&check).await?;
            if listing.trim().is_empty() {
                debug!(address = %self.address, marker = %marker, "Background process finished");
                return Ok(());
            }

            if let Some(max_wait) = poll.max_wait {
                if started.elapsed() >= max_wait {
                    return Err(RemoteError::Timeout {
                        marker: marker.to_string(),
                        seconds: max_wait.as_secs(),
                    });
                }
            }
            debug!(address = %self.address, marker = %marker, "Still running");
        }
    }

    /// Close the underlying session.
    pub async fn close(&self) -> Result<(), RemoteError> {
        debug!(address = %self.address, "Closing connection");
        self.session.close().await
    }
}

fn validate_marker(marker: &str) -> Result<(), RemoteError> {
    let valid = !marker.is_empty()
        && !marker.starts_with('-')
        && marker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RemoteError::InvalidMarker(marker.to_string()))
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
