//! firefleet: parallel BlueSky fire simulations on an elastic EC2 pool.
//!
//! A request's fires are each run on their own worker. Existing workers are
//! used first, the shortfall is launched on demand and terminated as soon
//! as its job ends, and the whole request is tracked in a status document
//! rewritten on every change.

pub mod aws;
pub mod cli;
pub mod config;
pub mod error;
pub mod fleet;
pub mod input;
pub mod notify;
pub mod orchestrator;
pub mod remote;
pub mod runner;
pub mod shutdown;
pub mod status;
pub mod storage;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{ProvisionError, RemoteError, StorageError};
pub use fleet::PoolError;
pub use input::InputError;
pub use orchestrator::OrchestratorError;
pub use runner::RunnerError;
