//! Selection of instances left running by runs that never cleaned up.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::InstanceState;

/// What the provider reports about one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: Option<String>,
    pub state: InstanceState,
    pub launch_time: Option<DateTime<Utc>>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

impl InstanceSummary {
    /// Address to reach the instance at, public first.
    pub fn address(&self) -> Option<&str> {
        self.public_ip
            .as_deref()
            .or(self.private_ip.as_deref())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.launch_time.map(|launched| now - launched)
    }
}

/// Running instances whose name matches `name_pattern` and that were
/// launched at least `min_age` before `now`.
///
/// Instances without a name or launch time are never selected.
pub fn select_orphans<'a>(
    instances: &'a [InstanceSummary],
    name_pattern: &Regex,
    min_age: Duration,
    now: DateTime<Utc>,
) -> Vec<&'a InstanceSummary> {
    instances
        .iter()
        .filter(|i| i.state == InstanceState::Running)
        .filter(|i| i.name.as_deref().is_some_and(|n| name_pattern.is_match(n)))
        .filter(|i| i.age(now).is_some_and(|age| age >= min_age))
        .collect()
}
