//! Workers and the collaborators that create, prepare and destroy them.

pub mod ec2;
pub mod init;
pub mod orphans;
pub mod pool;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

pub use ec2::Ec2Provisioner;
pub use init::{SshAutoShutdown, SshInitializer};
pub use orphans::{select_orphans, InstanceSummary};
pub use pool::{InstancePool, PoolConfig, PoolError, PoolServices};

/// Cloud lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

impl InstanceState {
    /// Parse a provider state name such as `shutting-down`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }

    /// Whether the instance still needs to be terminated.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Who owns a worker's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Supplied by the caller; never torn down here.
    Existing,
    /// Launched by the pool; torn down when the pool closes.
    New,
}

/// A compute instance that can run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Provider instance id, or the address for existing workers.
    pub id: String,
    pub name: Option<String>,
    /// Network address used for remote execution.
    pub address: String,
    pub state: InstanceState,
    pub provenance: Provenance,
}

impl Worker {
    /// A caller-supplied worker, identified by its address.
    pub fn existing(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            name: None,
            address,
            state: InstanceState::Running,
            provenance: Provenance::Existing,
        }
    }

    /// A worker launched by a provisioner.
    pub fn provisioned(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        state: InstanceState,
    ) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            address: address.into(),
            state,
            provenance: Provenance::New,
        }
    }

    pub fn is_new(&self) -> bool {
        self.provenance == Provenance::New
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}, {})", self.id, name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// How new workers are shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Stop,
    Terminate,
}

/// Creates and destroys cloud instances.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Launch one instance per name and wait until they are running.
    ///
    /// On partial failure returns [`ProvisionError::Partial`] carrying the
    /// instances that were created.
    async fn launch(&self, names: &[String]) -> Result<Vec<Worker>, ProvisionError>;

    /// Query the current state of an instance.
    async fn reload(&self, worker: &Worker) -> Result<InstanceState, ProvisionError>;

    async fn shutdown(&self, workers: &[Worker], mode: ShutdownMode)
        -> Result<(), ProvisionError>;
}

/// Prepares freshly launched workers for remote execution.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, workers: &[Worker]) -> Result<(), ProvisionError>;
}

/// Arranges for workers to shut themselves down after a delay.
#[async_trait]
pub trait AutoShutdownScheduler: Send + Sync {
    async fn schedule(&self, workers: &[Worker], minutes: u32) -> Result<(), ProvisionError>;
}
