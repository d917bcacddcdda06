//! Preparation of new workers over SSH.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{AutoShutdownScheduler, Initializer, Worker};
use crate::error::{ProvisionError, RemoteError};
use crate::remote::{shell_quote, RemoteExecutor, RemoteTransport};

/// Waits for SSH on each new worker and mounts the configured EFS volumes.
pub struct SshInitializer {
    transport: Arc<dyn RemoteTransport>,
    efs_volumes: Vec<(String, String)>,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl SshInitializer {
    pub fn new(transport: Arc<dyn RemoteTransport>, efs_volumes: Vec<(String, String)>) -> Self {
        Self {
            transport,
            efs_volumes,
            connect_attempts: 12,
            retry_delay: Duration::from_secs(10),
        }
    }

    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    async fn initialize_one(&self, worker: &Worker) -> Result<(), RemoteError> {
        let executor = connect_with_retry(
            self.transport.as_ref(),
            worker,
            self.connect_attempts,
            self.retry_delay,
        )
        .await?;
        let result = self.mount_volumes(&executor).await;
        if let Err(e) = executor.close().await {
            warn!(instance = %worker, error = %e, "Failed to close connection");
        }
        result?;
        info!(instance = %worker, "Instance ready");
        Ok(())
    }

    async fn mount_volumes(&self, executor: &RemoteExecutor) -> Result<(), RemoteError> {
        if self.efs_volumes.is_empty() {
            return Ok(());
        }
        executor
            .execute_ignoring_errors(
                "sudo apt-get update -qq && sudo apt-get install -y -qq nfs-common > /dev/null",
            )
            .await?;
        for (filesystem, mount_point) in &self.efs_volumes {
            executor
                .execute(&mount_command(filesystem, mount_point))
                .await?;
        }
        Ok(())
    }
}

/// New instances report `running` before sshd accepts connections.
async fn connect_with_retry(
    transport: &dyn RemoteTransport,
    worker: &Worker,
    attempts: u32,
    delay: Duration,
) -> Result<RemoteExecutor, RemoteError> {
    let mut attempt = 1;
    loop {
        match RemoteExecutor::connect(transport, &worker.address).await {
            Ok(executor) => return Ok(executor),
            Err(e) if attempt < attempts => {
                debug!(instance = %worker, attempt, error = %e, "SSH not ready; retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn mount_command(filesystem: &str, mount_point: &str) -> String {
    let mount_point = shell_quote(mount_point);
    format!(
        "sudo mkdir -p {mount_point} && sudo mount -t nfs4 \
         -o nfsvers=4.1,rsize=1048576,wsize=1048576,hard,timeo=600,retrans=2,noresvport \
         {} {mount_point}",
        shell_quote(filesystem)
    )
}

#[async_trait]
impl Initializer for SshInitializer {
    async fn initialize(&self, workers: &[Worker]) -> Result<(), ProvisionError> {
        let results = join_all(workers.iter().map(|w| self.initialize_one(w))).await;
        let failures: Vec<String> = workers
            .iter()
            .zip(results)
            .filter_map(|(w, r)| r.err().map(|e| format!("{}: {e}", w.id)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::InitializationFailed(failures.join("; ")))
        }
    }
}

/// Schedules an OS-level shutdown on each worker; instances are launched
/// with terminate-on-shutdown so this also terminates them.
pub struct SshAutoShutdown {
    transport: Arc<dyn RemoteTransport>,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl SshAutoShutdown {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            transport,
            connect_attempts: 12,
            retry_delay: Duration::from_secs(10),
        }
    }

    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    async fn schedule_one(&self, worker: &Worker, minutes: u32) -> Result<(), RemoteError> {
        let executor = connect_with_retry(
            self.transport.as_ref(),
            worker,
            self.connect_attempts,
            self.retry_delay,
        )
        .await?;
        // `shutdown` reports the scheduled time on stderr.
        let result = executor
            .execute_ignoring_errors(&format!("sudo shutdown -h +{minutes}"))
            .await;
        if let Err(e) = executor.close().await {
            warn!(instance = %worker, error = %e, "Failed to close connection");
        }
        result.map(|_| ())
    }
}

#[async_trait]
impl AutoShutdownScheduler for SshAutoShutdown {
    async fn schedule(&self, workers: &[Worker], minutes: u32) -> Result<(), ProvisionError> {
        info!(count = workers.len(), minutes, "Scheduling auto-shutdown");
        let results = join_all(workers.iter().map(|w| self.schedule_one(w, minutes))).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                warn!(instance = %worker, error = %e, "Failed to schedule auto-shutdown");
            }
        }
        Ok(())
    }
}
