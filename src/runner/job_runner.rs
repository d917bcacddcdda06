//! Drives one job to a terminal status on one worker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::bluesky::{self, PipelineSpec};
use super::{Job, RunnerError};
use crate::config::Config;
use crate::fleet::{InstancePool, Worker};
use crate::remote::{shell_quote, PollOptions, RemoteExecutor, RemoteTransport};
use crate::shutdown::ShutdownToken;
use crate::status::{RunStatus, RunUpdate, StatusTracker};
use crate::storage::{keys, upload_json, ObjectStore};

/// Shared by every job of a request.
pub struct RunContext {
    pub request_id: String,
    pub config: Arc<Config>,
    /// Fully merged bluesky config, written as `{"config": ...}`.
    pub bluesky_config: Value,
    pub transport: Arc<dyn RemoteTransport>,
    pub store: Arc<dyn ObjectStore>,
}

impl RunContext {
    /// Run id for `job`; an unusable format falls back to the fire id.
    pub fn run_id(&self, job: &Job) -> String {
        let config = &self.config;
        match job.run_id(
            config.run_id_format.as_deref(),
            &self.request_id,
            config.bluesky.today.as_deref(),
        ) {
            Ok(id) => id,
            Err(e) => {
                let fallback = job
                    .fire_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                warn!(error = %e, run_id = %fallback, "Invalid run id format; using fallback");
                fallback
            }
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub run_id: String,
    pub worker: Worker,
    pub status: RunStatus,
    pub message: Option<String>,
    pub output_url: Option<String>,
    pub log_url: Option<String>,
}

#[derive(Debug, Default)]
struct Artifacts {
    output_url: Option<String>,
    log_url: Option<String>,
}

/// Outcome of a pipeline that ran to completion.
struct Finished {
    status: RunStatus,
    message: Option<String>,
}

pub struct JobRunner<'a> {
    ctx: &'a RunContext,
    tracker: &'a StatusTracker,
    pool: &'a InstancePool,
    shutdown: &'a ShutdownToken,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        ctx: &'a RunContext,
        tracker: &'a StatusTracker,
        pool: &'a InstancePool,
        shutdown: &'a ShutdownToken,
    ) -> Self {
        Self {
            ctx,
            tracker,
            pool,
            shutdown,
        }
    }

    /// Run `job` on `worker`.
    ///
    /// Never fails: any error ends the run as `unknown`. Exactly one terminal
    /// status is recorded, after which new workers are terminated.
    pub async fn run(&self, job: Job, worker: Worker) -> JobReport {
        let run_id = self.ctx.run_id(&job);
        info!(run_id = %run_id, worker = %worker, "Starting run");

        let mut artifacts = Artifacts::default();
        let result = self.attempt(&job, &worker, &run_id, &mut artifacts).await;

        let (status, message) = match result {
            Ok(finished) => (finished.status, finished.message),
            Err(e) => {
                error!(run_id = %run_id, worker = %worker, error = %e, "Run failed");
                (RunStatus::Unknown, Some(e.to_string()))
            }
        };

        let update = RunUpdate {
            message: message.clone(),
            output_url: artifacts.output_url.clone(),
            log_url: artifacts.log_url.clone(),
        };
        if let Err(e) = self.tracker.set_run_status(&run_id, status, update).await {
            error!(run_id = %run_id, error = %e, "Failed to record run status");
        }
        info!(run_id = %run_id, status = %status, "Run finished");

        self.pool.terminate_instance(&worker).await;

        JobReport {
            run_id,
            worker,
            status,
            message,
            output_url: artifacts.output_url,
            log_url: artifacts.log_url,
        }
    }

    async fn attempt(
        &self,
        job: &Job,
        worker: &Worker,
        run_id: &str,
        artifacts: &mut Artifacts,
    ) -> Result<Finished, RunnerError> {
        self.tracker
            .set_run_status(run_id, RunStatus::Running, RunUpdate::default())
            .await?;
        upload_json(
            self.ctx.store.as_ref(),
            &job.input_document(),
            &keys::run_input(&self.ctx.request_id, run_id),
        )
        .await?;

        let executor = RemoteExecutor::connect(self.ctx.transport.as_ref(), &worker.address).await?;
        let result = self.execute(&executor, job, run_id, artifacts).await;
        if let Err(e) = executor.close().await {
            warn!(worker = %worker, error = %e, "Failed to close connection");
        }
        result
    }

    async fn execute(
        &self,
        executor: &RemoteExecutor,
        job: &Job,
        run_id: &str,
        artifacts: &mut Artifacts,
    ) -> Result<Finished, RunnerError> {
        let config = &self.ctx.config;
        let home = executor.execute("echo $HOME").await?.trim().to_string();
        if home.is_empty() {
            return Err(RunnerError::MissingHomeDir(executor.address().to_string()));
        }
        let run_dir = format!("{home}/data/bluesky/{run_id}");
        let quoted_dir = shell_quote(&run_dir);

        // Leftovers from an earlier run with the same id.
        executor
            .execute_ignoring_errors(&format!("rm -rf {quoted_dir}"))
            .await?;
        executor.execute(&format!("mkdir -p {quoted_dir}")).await?;
        executor
            .write_json(
                &json!({ "config": self.ctx.bluesky_config }),
                &format!("{run_dir}/config.json"),
            )
            .await?;
        executor
            .write_json(&job.input_document(), &format!("{run_dir}/input.json"))
            .await?;

        ensure_docker(executor).await?;
        let image = config.bluesky_image();
        ensure_image(executor, &image).await?;

        let command = bluesky::pipeline_command(&PipelineSpec {
            host_dir: &run_dir,
            image: &image,
            run_id,
            today: config.bluesky.today.as_deref(),
            modules: &config.bluesky.modules,
        });
        let poll = PollOptions::every(Duration::from_secs(
            config.bluesky.seconds_between_completion_checks.max(1),
        ))
        .with_max_wait(
            config
                .bluesky
                .max_run_minutes
                .map(|m| Duration::from_secs(m * 60)),
        );
        info!(run_id = %run_id, address = %executor.address(), "Running bluesky");
        let container = bluesky::container_name(run_id);
        if let Err(e) = executor
            .run_detached(&command, &container, poll, self.shutdown)
            .await
        {
            // Don't leave the container running on a worker that outlives us.
            if let Err(stop) = executor
                .execute_ignoring_errors(&format!("docker rm -f {container}"))
                .await
            {
                warn!(container = %container, error = %stop, "Failed to stop container");
            }
            return Err(e.into());
        }

        // Files written by the container are owned by root.
        executor
            .execute_ignoring_errors(&format!("sudo chown -R $USER:$USER {quoted_dir}"))
            .await?;

        let log_path = format!("{run_dir}/output.log");
        let log_key = keys::run_log(&self.ctx.request_id, run_id);
        if self
            .ctx
            .store
            .remote_upload_command(&log_path, &log_key)
            .is_some()
        {
            self.ensure_credentials(executor, &home).await?;
        }
        artifacts.log_url = self.publish(executor, &log_path, &log_key).await?;

        let output = executor
            .execute(&format!("cat {}", shell_quote(&format!("{run_dir}/output.json"))))
            .await?;
        let output: Value = serde_json::from_str(&output)
            .map_err(|e| RunnerError::InvalidOutput(e.to_string()))?;
        let finished = match bluesky::run_error(&output) {
            Some(message) => Finished {
                status: RunStatus::Failure,
                message: Some(message),
            },
            None => Finished {
                status: RunStatus::Success,
                message: None,
            },
        };

        let exports = format!("{run_dir}/exports");
        let export_dir = format!("{exports}/{run_id}");
        let present = executor
            .execute_ignoring_errors(&format!(
                "test -d {} && echo yes || true",
                shell_quote(&export_dir)
            ))
            .await?;
        if present.trim() == "yes" {
            executor
                .execute(&format!(
                    "cd {} && tar czf {} {}",
                    shell_quote(&exports),
                    shell_quote(&format!("{run_id}.tar.gz")),
                    shell_quote(run_id)
                ))
                .await?;
            artifacts.output_url = self
                .publish(
                    executor,
                    &format!("{exports}/{run_id}.tar.gz"),
                    &keys::run_output(&config.aws.s3.output_path, &self.ctx.request_id, run_id),
                )
                .await?;
        } else {
            warn!(run_id = %run_id, "No exported output to publish");
        }

        if config.cleanup_output {
            executor
                .execute_ignoring_errors(&format!("rm -rf {quoted_dir}"))
                .await?;
        }
        Ok(finished)
    }

    /// Copy local cloud credentials to the worker unless it already has some.
    /// Without a configured credentials file the worker's instance profile is
    /// relied on.
    async fn ensure_credentials(
        &self,
        executor: &RemoteExecutor,
        home: &str,
    ) -> Result<(), RunnerError> {
        let Some(local) = self.ctx.config.aws.credentials_file.as_deref() else {
            return Ok(());
        };
        let present = executor
            .execute_ignoring_errors("test -f ~/.aws/credentials && echo yes || true")
            .await?;
        if present.trim() == "yes" {
            return Ok(());
        }
        info!(address = %executor.address(), "Copying credentials to worker");
        executor.execute("mkdir -p ~/.aws").await?;
        executor
            .put(Path::new(local), &format!("{home}/.aws/credentials"))
            .await?;
        Ok(())
    }

    /// Publish a file from the worker, returning its URL once the store
    /// confirms the object exists.
    async fn publish(
        &self,
        executor: &RemoteExecutor,
        remote_path: &str,
        key: &str,
    ) -> Result<Option<String>, RunnerError> {
        let store = self.ctx.store.as_ref();
        match store.remote_upload_command(remote_path, key) {
            Some(command) => {
                executor.execute(&command).await?;
            }
            None => {
                let dir = tempfile::tempdir()?;
                let local = dir.path().join("artifact");
                executor.get(remote_path, &local).await?;
                store.upload_file(&local, key).await?;
            }
        }

        let url = store.url(key);
        match store.exists(&url).await {
            Ok(true) => Ok(Some(url)),
            Ok(false) => {
                warn!(url = %url, "Published object not found");
                Ok(None)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Could not confirm published object");
                Ok(None)
            }
        }
    }
}

async fn ensure_docker(executor: &RemoteExecutor) -> Result<(), RunnerError> {
    if !executor.execute("which docker || true").await?.trim().is_empty() {
        return Ok(());
    }
    info!(address = %executor.address(), "Installing docker");
    // The install script reports progress on stderr.
    executor
        .execute_ignoring_errors(
            "curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && sudo sh /tmp/get-docker.sh",
        )
        .await?;
    executor
        .execute_ignoring_errors("sudo chmod 666 /var/run/docker.sock")
        .await?;
    if executor.execute("which docker || true").await?.trim().is_empty() {
        return Err(RunnerError::DependencyMissing("docker".to_string()));
    }
    Ok(())
}

async fn ensure_image(executor: &RemoteExecutor, image: &str) -> Result<(), RunnerError> {
    let quoted = shell_quote(image);
    if !executor
        .execute(&format!("docker images -q {quoted}"))
        .await?
        .trim()
        .is_empty()
    {
        return Ok(());
    }
    info!(address = %executor.address(), image = %image, "Pulling image");
    executor
        .execute_ignoring_errors(&format!("docker pull -q {quoted}"))
        .await?;
    if executor
        .execute(&format!("docker images -q {quoted}"))
        .await?
        .trim()
        .is_empty()
    {
        return Err(RunnerError::DependencyMissing(image.to_string()));
    }
    Ok(())
}
