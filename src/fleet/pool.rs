//! The elastic pool of workers for one run.
//!
//! The pool reuses caller-supplied workers first and launches only the
//! shortfall. It owns every worker it launched: each is terminated either
//! by its job runner as soon as the job ends, or at the latest by
//! [`InstancePool::close`], which the orchestrator calls on every exit path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{AutoShutdownScheduler, Initializer, Provisioner, ShutdownMode, Worker};
use crate::config::wildcards::short_uuid;
use crate::error::ProvisionError;
use crate::shutdown::ShutdownToken;

/// Errors raised while opening or closing the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    /// The run was interrupted; any launched workers are recorded for teardown.
    #[error("Interrupted ({0}) while opening instance pool")]
    Interrupted(String),

    #[error("Launch task failed: {0}")]
    LaunchTask(String),

    #[error("Gave up after {seconds} seconds waiting for in-flight launch to settle")]
    LaunchWaitTimeout { seconds: u64 },
}

/// Settings for one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for new instance names; a short random suffix and an index are appended.
    pub name_prefix: String,
    pub minutes_until_auto_shutdown: Option<u32>,
    /// How often to check an in-flight launch after an interrupt.
    pub launch_poll_interval: Duration,
    /// How many checks before giving up on an in-flight launch.
    pub launch_wait_attempts: u32,
}

impl PoolConfig {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            minutes_until_auto_shutdown: None,
            launch_poll_interval: Duration::from_secs(5),
            launch_wait_attempts: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchState {
    NotStarted,
    InFlight,
    Settled,
}

#[derive(Debug)]
struct PoolState {
    new_instances: Vec<Worker>,
    launch: LaunchState,
}

/// Collaborators the pool drives.
#[derive(Clone)]
pub struct PoolServices {
    pub provisioner: Arc<dyn Provisioner>,
    pub initializer: Arc<dyn Initializer>,
    pub auto_shutdown: Arc<dyn AutoShutdownScheduler>,
}

/// Workers available to one run.
pub struct InstancePool {
    services: PoolServices,
    config: PoolConfig,
    existing: Vec<Worker>,
    desired_total: usize,
    state: Arc<Mutex<PoolState>>,
    terminated: Mutex<HashSet<String>>,
}

impl InstancePool {
    pub fn new(
        services: PoolServices,
        config: PoolConfig,
        desired_total: usize,
        existing: Vec<Worker>,
    ) -> Self {
        Self {
            services,
            config,
            existing,
            desired_total,
            state: Arc::new(Mutex::new(PoolState {
                new_instances: Vec::new(),
                launch: LaunchState::NotStarted,
            })),
            terminated: Mutex::new(HashSet::new()),
        }
    }

    /// Number of workers to launch for this run.
    pub fn num_new(&self) -> usize {
        self.desired_total.saturating_sub(self.existing.len())
    }

    /// Launch and prepare the shortfall of workers.
    ///
    /// Whatever this returns, [`close`](Self::close) must be called
    /// afterwards: workers created before a failure or interrupt are
    /// recorded and only released there.
    pub async fn open(&self, shutdown: &ShutdownToken) -> Result<(), PoolError> {
        let num_new = self.num_new();
        if num_new == 0 {
            info!(
                existing = self.existing.len(),
                desired = self.desired_total,
                "No new instances needed"
            );
            return Ok(());
        }
        if shutdown.is_cancelled() {
            return Err(PoolError::Interrupted(cancel_reason(shutdown)));
        }

        let names = instance_names(&self.config.name_prefix, num_new);
        info!(count = num_new, first = %names[0], "Launching new instances");

        self.state.lock().await.launch = LaunchState::InFlight;
        let mut task = tokio::spawn({
            let provisioner = self.services.provisioner.clone();
            let state = self.state.clone();
            async move {
                let result = provisioner.launch(&names).await;
                let mut state = state.lock().await;
                match &result {
                    Ok(workers) => state.new_instances.extend(workers.iter().cloned()),
                    Err(ProvisionError::Partial { created, .. }) => {
                        state.new_instances.extend(created.iter().cloned())
                    }
                    Err(_) => {}
                }
                state.launch = LaunchState::Settled;
                result
            }
        });

        let launched = tokio::select! {
            joined = &mut task => {
                joined.map_err(|e| PoolError::LaunchTask(e.to_string()))??
            }
            _ = shutdown.cancelled() => {
                warn!("Interrupted while instances are launching; waiting for launch to settle");
                self.wait_for_launch().await?;
                return Err(PoolError::Interrupted(cancel_reason(shutdown)));
            }
        };
        info!(count = launched.len(), "Instances running");

        if let Some(minutes) = self.config.minutes_until_auto_shutdown {
            if let Err(e) = self.services.auto_shutdown.schedule(&launched, minutes).await {
                warn!(error = %e, minutes, "Failed to schedule auto-shutdown");
            }
        }

        tokio::select! {
            result = self.services.initializer.initialize(&launched) => result?,
            _ = shutdown.cancelled() => {
                return Err(PoolError::Interrupted(cancel_reason(shutdown)));
            }
        }
        info!(count = launched.len(), "New instances initialized");
        Ok(())
    }

    async fn wait_for_launch(&self) -> Result<(), PoolError> {
        for _ in 0..self.config.launch_wait_attempts {
            if self.state.lock().await.launch == LaunchState::Settled {
                return Ok(());
            }
            tokio::time::sleep(self.config.launch_poll_interval).await;
        }
        if self.state.lock().await.launch == LaunchState::Settled {
            return Ok(());
        }
        let waited = self.config.launch_poll_interval * self.config.launch_wait_attempts;
        error!(
            prefix = %self.config.name_prefix,
            "Launch did not settle; instances with this name prefix may need manual cleanup"
        );
        Err(PoolError::LaunchWaitTimeout {
            seconds: waited.as_secs(),
        })
    }

    /// Existing workers followed by new ones, never more than requested.
    pub async fn instances(&self) -> Vec<Worker> {
        let state = self.state.lock().await;
        self.existing
            .iter()
            .chain(state.new_instances.iter())
            .take(self.desired_total)
            .cloned()
            .collect()
    }

    /// Workers launched by this pool so far.
    pub async fn new_instances(&self) -> Vec<Worker> {
        self.state.lock().await.new_instances.clone()
    }

    /// Terminate a worker once its job is done. No-op for workers this pool
    /// did not launch, and for workers already terminated here.
    pub async fn terminate_instance(&self, worker: &Worker) {
        if !worker.is_new() {
            return;
        }
        let owned = self
            .state
            .lock()
            .await
            .new_instances
            .iter()
            .any(|w| w.id == worker.id);
        if !owned || !self.terminated.lock().await.insert(worker.id.clone()) {
            return;
        }

        info!(instance = %worker, "Terminating instance");
        if let Err(e) = self
            .services
            .provisioner
            .shutdown(std::slice::from_ref(worker), ShutdownMode::Terminate)
            .await
        {
            error!(instance = %worker, error = %e, "Failed to terminate instance");
        }
    }

    /// Terminate every launched worker that is still pending or running.
    ///
    /// Workers whose state cannot be queried are assumed gone. Safe to call
    /// more than once.
    pub async fn close(&self) -> Result<(), PoolError> {
        let workers = self.new_instances().await;
        if workers.is_empty() {
            return Ok(());
        }

        let provisioner = &self.services.provisioner;
        let states = join_all(workers.iter().map(|w| provisioner.reload(w))).await;

        let live: Vec<Worker> = workers
            .into_iter()
            .zip(states)
            .filter_map(|(worker, state)| match state {
                Ok(state) if state.is_live() => Some(Worker { state, ..worker }),
                Ok(_) => None,
                Err(e) => {
                    warn!(instance = %worker, error = %e, "Failed to reload instance; assuming it is gone");
                    None
                }
            })
            .collect();

        if live.is_empty() {
            return Ok(());
        }

        info!(count = live.len(), "Terminating remaining new instances");
        provisioner
            .shutdown(&live, ShutdownMode::Terminate)
            .await
            .map_err(PoolError::from)?;
        self.terminated
            .lock()
            .await
            .extend(live.iter().map(|w| w.id.clone()));
        Ok(())
    }

    /// Whether `worker` is recorded as terminated by this pool.
    pub async fn was_terminated(&self, worker: &Worker) -> bool {
        self.terminated.lock().await.contains(&worker.id)
    }
}

fn cancel_reason(shutdown: &ShutdownToken) -> String {
    shutdown.reason().unwrap_or_else(|| "cancelled".to_string())
}

/// `{prefix}-{8 hex chars}-{n}` for n in 1..=count.
pub fn instance_names(prefix: &str, count: usize) -> Vec<String> {
    let base = format!("{}-{}", prefix.trim_end_matches('-'), short_uuid());
    (1..=count).map(|n| format!("{base}-{n}")).collect()
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("existing", &self.existing.len())
            .field("desired_total", &self.desired_total)
            .finish()
    }
}
