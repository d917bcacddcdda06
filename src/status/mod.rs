//! The persisted status document of a run.
//!
//! The document has three tiers: system state, a count of runs per status,
//! and the per-run records. It is rewritten wholesale after every change by
//! the [`StatusTracker`].

pub mod tracker;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use tracker::{ObjectStoreStatusSink, RunUpdate, StatusSink, StatusTracker};

/// Overall state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Running,
    Waiting,
    Complete,
}

/// Machine-readable reason attached to the system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemError {
    WaitingForMet,
    WaitingForFires,
    WaitingForFiresAndMet,
    NoFireData,
    ProvisioningFailed,
    Aborted,
    SomeRunsFailed,
    SomeRunsUnknown,
    SomeRunsUnknownAndFailed,
}

impl SystemError {
    /// Summary of job outcomes, or `None` when every job succeeded.
    pub fn summarize(counts: &StatusCounts) -> Option<Self> {
        match (counts.failure > 0, counts.unknown > 0) {
            (true, true) => Some(Self::SomeRunsUnknownAndFailed),
            (true, false) => Some(Self::SomeRunsFailed),
            (false, true) => Some(Self::SomeRunsUnknown),
            (false, false) => None,
        }
    }
}

/// State of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Running,
    Success,
    Failure,
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Unknown)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Number of runs currently in each status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting: usize,
    pub running: usize,
    pub success: usize,
    pub failure: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn get(&self, status: RunStatus) -> usize {
        match status {
            RunStatus::Waiting => self.waiting,
            RunStatus::Running => self.running,
            RunStatus::Success => self.success,
            RunStatus::Failure => self.failure,
            RunStatus::Unknown => self.unknown,
        }
    }

    fn slot(&mut self, status: RunStatus) -> &mut usize {
        match status {
            RunStatus::Waiting => &mut self.waiting,
            RunStatus::Running => &mut self.running,
            RunStatus::Success => &mut self.success,
            RunStatus::Failure => &mut self.failure,
            RunStatus::Unknown => &mut self.unknown,
        }
    }

    /// Move one run from `from` (if any) to `to`.
    pub(crate) fn transition(&mut self, from: Option<RunStatus>, to: RunStatus) {
        if let Some(from) = from {
            let slot = self.slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.slot(to) += 1;
    }

    pub fn total(&self) -> usize {
        self.waiting + self.running + self.success + self.failure + self.unknown
    }
}

/// What is known about one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub system_state: SystemState,
    pub system_error: Option<SystemError>,
    pub system_message: Option<String>,
    pub runs: BTreeMap<String, RunRecord>,
    pub counts: StatusCounts,
}

impl Default for StatusDocument {
    fn default() -> Self {
        Self {
            system_state: SystemState::Running,
            system_error: None,
            system_message: None,
            runs: BTreeMap::new(),
            counts: StatusCounts::default(),
        }
    }
}
