//! Wait-and-retry policy for input that is not available yet.

use std::time::Duration;

use crate::config::{WaitSettings, WaitStrategy};

/// Whether a failed attempt may succeed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input does not exist yet; waiting may help.
    NotYetAvailable,
    /// Retrying cannot help.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub strategy: WaitStrategy,
    pub wait: Duration,
    pub max_attempts: u32,
}

impl From<&WaitSettings> for RetryPolicy {
    fn from(settings: &WaitSettings) -> Self {
        Self {
            strategy: settings.strategy,
            wait: Duration::from_secs(settings.time),
            max_attempts: settings.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Abort,
}

/// Decide what to do after `attempt` (1-based) failed with `kind`.
///
/// The first wait is the configured time; with `backoff` every later wait
/// doubles the previous one.
pub fn decide(attempt: u32, kind: ErrorKind, policy: &RetryPolicy) -> RetryDecision {
    if kind == ErrorKind::Terminal || attempt >= policy.max_attempts {
        return RetryDecision::Abort;
    }
    let delay = match policy.strategy {
        WaitStrategy::Fixed => policy.wait,
        WaitStrategy::Backoff => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            policy.wait.saturating_mul(factor)
        }
    };
    RetryDecision::Retry(delay)
}
