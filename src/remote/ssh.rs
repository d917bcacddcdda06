//! OpenSSH transport.
//!
//! Each session starts one ControlMaster connection and multiplexes every
//! command and copy over its control socket, so a job pays for the key
//! exchange once.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use super::{CommandOutput, RemoteSession, RemoteTransport};
use crate::error::RemoteError;

/// Connection settings shared by every session.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
}

impl SshOptions {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            self.key_path.display().to_string(),
        ]
    }
}

/// Opens ControlMaster sessions with the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// Open a session directly, without boxing.
    pub async fn open(&self, address: &str) -> Result<SshSession, RemoteError> {
        let dir = tempfile::Builder::new().prefix("ff-ssh").tempdir()?;
        let socket = dir.path().join("ctl");
        let target = format!("{}@{}", self.options.user, address);

        let output = Command::new("ssh")
            .args(["-M", "-S"])
            .arg(&socket)
            .args(["-fN", "-o", "ControlPersist=yes"])
            .args(self.options.common_args())
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RemoteError::ConnectFailed {
                address: address.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(SshSession {
            target,
            socket,
            options: self.options.clone(),
            closed: AtomicBool::new(false),
            _dir: dir,
        })
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(Box::new(self.open(address).await?))
    }
}

/// One multiplexed connection to a worker.
pub struct SshSession {
    target: String,
    socket: PathBuf,
    options: SshOptions,
    closed: AtomicBool,
    _dir: TempDir,
}

impl SshSession {
    fn control_path(&self) -> String {
        format!("ControlPath={}", self.socket.display())
    }

    async fn scp(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let output = Command::new("scp")
            .args(["-q", "-o", &self.control_path()])
            .args(self.options.common_args())
            .args([from, to])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::TransferFailed {
                from: from.to_string(),
                to: to.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = Command::new("ssh")
            .arg("-S")
            .arg(&self.socket)
            .args(self.options.common_args())
            .arg("--")
            .arg(&self.target)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let to = format!("{}:{}", self.target, remote);
        self.scp(&local.display().to_string(), &to).await
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let from = format!("{}:{}", self.target, remote);
        self.scp(&from, &local.display().to_string()).await
    }

    async fn close(&self) -> Result<(), RemoteError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let status = Command::new("ssh")
            .arg("-S")
            .arg(&self.socket)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            tracing::debug!(host = %self.target, "Control master already gone");
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Best effort; the master would otherwise outlive the run.
        let _ = std::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.socket)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}
