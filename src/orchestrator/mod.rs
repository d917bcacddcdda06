//! Parallel orchestration of one request.
//!
//! ```text
//! input → request id → jobs → InstancePool.open → JobRunner × N (concurrent) → close → finalize → notify
//! ```
//!
//! The pool is closed on every path once it has been opened, and the status
//! document is the record of per-job outcomes: the orchestrator itself only
//! fails when the machinery could not run (bad input, provisioning failure,
//! interrupt).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, UnpairedJobsPolicy};
use crate::error::StorageError;
use crate::fleet::{InstancePool, PoolConfig, PoolError, PoolServices, Worker};
use crate::input::{self, InputBatch, InputError, InputLoader, RetryPolicy};
use crate::notify::Notifier;
use crate::remote::RemoteTransport;
use crate::runner::{bluesky, Job, JobReport, JobRunner, RunContext, RunnerError};
use crate::shutdown::ShutdownToken;
use crate::status::{
    RunStatus, RunUpdate, StatusDocument, StatusSink, StatusTracker, SystemError, SystemState,
};
use crate::storage::{keys, upload_json, ObjectStore};

/// Message recorded for jobs left without a worker.
pub const UNPAIRED_MESSAGE: &str = "not run: no worker available";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Bluesky configuration error: {0}")]
    BlueskyConfig(#[from] RunnerError),

    #[error("Instance pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("{jobs} jobs but only {workers} workers")]
    UnpairedJobs { jobs: usize, workers: usize },

    #[error("Run aborted: {0}")]
    Interrupted(String),

    #[error("Failed to persist status: {0}")]
    Status(#[from] StorageError),
}

/// Everything the orchestrator drives besides configuration.
#[derive(Clone)]
pub struct Collaborators {
    pub pool: PoolServices,
    pub transport: Arc<dyn RemoteTransport>,
    pub store: Arc<dyn ObjectStore>,
    pub status_sink: Arc<dyn StatusSink>,
    pub notifier: Arc<dyn Notifier>,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Addresses of already-running workers to use before launching any.
    pub existing: Vec<String>,
    /// Overrides the configured request id.
    pub request_id: Option<String>,
}

/// Result of a completed request.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub request_id: String,
    pub reports: Vec<JobReport>,
    /// Run ids of jobs that had no worker.
    pub unpaired: Vec<String>,
    pub status: StatusDocument,
}

/// Runs every fire of a request, one per worker, concurrently.
pub struct ParallelOrchestrator {
    config: Arc<Config>,
    services: Collaborators,
    loader: InputLoader,
    pool_config: Option<PoolConfig>,
}

impl ParallelOrchestrator {
    pub fn new(config: Config, services: Collaborators) -> Self {
        let loader = InputLoader::new(RetryPolicy::from(&config.input.wait));
        Self {
            config: Arc::new(config),
            services,
            loader,
            pool_config: None,
        }
    }

    /// Replace the input loader, e.g. to change its retry policy.
    pub fn with_loader(mut self, loader: InputLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Use `pool_config` for the instance pool instead of one derived from
    /// the configuration.
    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = Some(pool_config);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the request whose input is at `source`.
    pub async fn run(
        &self,
        source: &str,
        options: RunOptions,
        shutdown: &ShutdownToken,
    ) -> Result<RunSummary, OrchestratorError> {
        let request_id = match options.request_id {
            Some(id) => id,
            None => self.config.request_id(&input::file_name(source))?,
        };
        info!(request_id = %request_id, source = %source, "Starting request");

        let tracker = StatusTracker::new(request_id.clone(), self.services.status_sink.clone());
        if let Err(e) = tracker
            .set_system_state(SystemState::Running, None, None)
            .await
        {
            warn!(error = %e, "Failed to record initial status");
        }

        let batch = match self.loader.load(source, &tracker, shutdown).await {
            Ok(batch) => batch,
            Err(InputError::Interrupted) => {
                let reason = self.abort(&tracker, shutdown).await;
                return Err(OrchestratorError::Interrupted(reason));
            }
            Err(e) => {
                self.notify(&tracker).await;
                return Err(e.into());
            }
        };
        if tracker.snapshot().await.system_state != SystemState::Running {
            if let Err(e) = tracker
                .set_system_state(SystemState::Running, None, None)
                .await
            {
                warn!(error = %e, "Failed to record running status");
            }
        }

        let bluesky_config = match self.bluesky_config(&batch) {
            Ok(config) => config,
            Err(e) => {
                self.fail(&tracker, SystemError::Aborted, e.to_string()).await;
                return Err(e.into());
            }
        };
        self.publish_request(&request_id, &batch, &bluesky_config)
            .await;

        let jobs: Vec<Job> = batch.fires.iter().cloned().map(Job::from_fire).collect();
        let existing: Vec<Worker> = options.existing.iter().map(Worker::existing).collect();
        let desired = desired_total(jobs.len(), self.config.aws.ec2.max_num_instances);
        if jobs.len() > desired && self.config.unpaired_jobs == UnpairedJobsPolicy::Error {
            let err = OrchestratorError::UnpairedJobs {
                jobs: jobs.len(),
                workers: desired,
            };
            self.fail(&tracker, SystemError::Aborted, err.to_string()).await;
            return Err(err);
        }

        let ctx = RunContext {
            request_id: request_id.clone(),
            config: self.config.clone(),
            bluesky_config,
            transport: self.services.transport.clone(),
            store: self.services.store.clone(),
        };
        let run_ids: Vec<String> = jobs.iter().map(|job| ctx.run_id(job)).collect();
        for run_id in duplicate_run_ids(&run_ids) {
            warn!(
                run_id = %run_id,
                "Several fires share this run id; their status and artifacts will overwrite each other"
            );
        }

        let pool_config = match &self.pool_config {
            Some(config) => config.clone(),
            None => {
                let mut config = PoolConfig::new(self.config.name_prefix(&request_id)?);
                config.minutes_until_auto_shutdown = self.config.aws.ec2.minutes_until_auto_shutdown;
                config
            }
        };
        let pool = InstancePool::new(self.services.pool.clone(), pool_config, desired, existing);

        let outcome = self.execute(&ctx, &tracker, &pool, jobs, shutdown).await;
        let closed = pool.close().await;
        if let Err(e) = &closed {
            error!(request_id = %request_id, error = %e, "Failed to tear down instances");
        }

        // Failures inside `execute` have already been recorded and notified.
        let (reports, unpaired) = outcome?;

        if shutdown.is_cancelled() {
            let reason = self.abort(&tracker, shutdown).await;
            return Err(OrchestratorError::Interrupted(reason));
        }

        let status = tracker.finalize().await?;
        self.notify(&tracker).await;
        closed?;

        Ok(RunSummary {
            request_id,
            reports,
            unpaired,
            status,
        })
    }

    /// Open the pool and run every paired job. The caller closes the pool.
    async fn execute(
        &self,
        ctx: &RunContext,
        tracker: &StatusTracker,
        pool: &InstancePool,
        jobs: Vec<Job>,
        shutdown: &ShutdownToken,
    ) -> Result<(Vec<JobReport>, Vec<String>), OrchestratorError> {
        if let Err(e) = pool.open(shutdown).await {
            return Err(match e {
                PoolError::Interrupted(_) => {
                    let reason = self.abort(tracker, shutdown).await;
                    OrchestratorError::Interrupted(reason)
                }
                other => {
                    self.fail(tracker, SystemError::ProvisioningFailed, other.to_string())
                        .await;
                    other.into()
                }
            });
        }

        let workers = pool.instances().await;
        let paired = jobs.len().min(workers.len());
        let mut jobs = jobs.into_iter();
        let pairs: Vec<(Job, Worker)> = jobs.by_ref().take(paired).zip(workers).collect();

        let mut unpaired = Vec::new();
        for job in jobs {
            let run_id = ctx.run_id(&job);
            warn!(run_id = %run_id, "{}", UNPAIRED_MESSAGE);
            if let Err(e) = tracker
                .set_run_status(&run_id, RunStatus::Unknown, RunUpdate::message(UNPAIRED_MESSAGE))
                .await
            {
                warn!(run_id = %run_id, error = %e, "Failed to record unpaired job");
            }
            unpaired.push(run_id);
        }

        info!(jobs = pairs.len(), "Running jobs");
        let runner = JobRunner::new(ctx, tracker, pool, shutdown);
        let reports = join_all(
            pairs
                .into_iter()
                .map(|(job, worker)| runner.run(job, worker)),
        )
        .await;
        Ok((reports, unpaired))
    }

    fn bluesky_config(&self, batch: &InputBatch) -> Result<Value, RunnerError> {
        let file = match &self.config.bluesky.config_file {
            Some(path) => bluesky::load_config_file(std::path::Path::new(path))?,
            None => json!({}),
        };
        Ok(bluesky::merge_config(
            &file,
            &self.config.bluesky.config,
            &batch.run_config,
        ))
    }

    /// Publish the request record, configs and index marker. Best-effort.
    async fn publish_request(&self, request_id: &str, batch: &InputBatch, bluesky_config: &Value) {
        let store = self.services.store.as_ref();
        let uploads = [
            (keys::request(request_id), batch.document.clone()),
            (keys::orchestrator_config(request_id), self.config.redacted()),
            (
                keys::bluesky_config(request_id),
                json!({ "config": bluesky_config }),
            ),
        ];
        for (key, value) in &uploads {
            if let Err(e) = upload_json(store, value, key).await {
                warn!(key = %key, error = %e, "Failed to publish request artifact");
            }
        }
        let index = keys::request_index(Utc::now(), request_id);
        if let Err(e) = store.upload_bytes(b"", &index).await {
            warn!(key = %index, error = %e, "Failed to publish request index");
        }
    }

    async fn fail(&self, tracker: &StatusTracker, error: SystemError, message: String) {
        error!(request_id = %tracker.request_id(), error = ?error, message = %message, "Request failed");
        if let Err(e) = tracker
            .set_system_state(SystemState::Complete, Some(error), Some(message))
            .await
        {
            warn!(error = %e, "Failed to record request failure");
        }
        self.notify(tracker).await;
    }

    /// Record an interrupt and return its reason.
    async fn abort(&self, tracker: &StatusTracker, shutdown: &ShutdownToken) -> String {
        let reason = shutdown
            .reason()
            .unwrap_or_else(|| "interrupted".to_string());
        warn!(request_id = %tracker.request_id(), reason = %reason, "Request aborted");
        if let Err(e) = tracker
            .set_system_state(
                SystemState::Complete,
                Some(SystemError::Aborted),
                Some(reason.clone()),
            )
            .await
        {
            warn!(error = %e, "Failed to record abort");
        }
        self.notify(tracker).await;
        reason
    }

    async fn notify(&self, tracker: &StatusTracker) {
        let status = tracker.snapshot().await;
        self.services
            .notifier
            .notify(tracker.request_id(), &status)
            .await;
    }
}

/// Run ids that occur more than once, in first-seen order.
fn duplicate_run_ids(run_ids: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for id in run_ids {
        if !seen.insert(id.as_str()) && !duplicates.contains(&id.as_str()) {
            duplicates.push(id.as_str());
        }
    }
    duplicates
}

/// Number of workers for `jobs` jobs, capped by `max_instances`.
pub fn desired_total(jobs: usize, max_instances: Option<usize>) -> usize {
    match max_instances {
        Some(max) => jobs.min(max),
        None => jobs,
    }
}
