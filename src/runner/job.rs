//! A single fire to run.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::wildcards::{self, Wildcards};
use crate::config::ConfigError;

/// One unit of work: a single fire.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// The fire's `id`, if it has one.
    pub fire_id: Option<String>,
    pub payload: Value,
}

impl Job {
    pub fn from_fire(payload: Value) -> Self {
        let fire_id = match payload.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Self { fire_id, payload }
    }

    /// The input document for this job alone.
    pub fn input_document(&self) -> Value {
        json!({ "fires": [self.payload] })
    }

    /// Derive the run id.
    ///
    /// Without a format the fire id is used, or a fresh UUID when the fire
    /// has none.
    pub fn run_id(
        &self,
        format: Option<&str>,
        request_id: &str,
        bluesky_today: Option<&str>,
    ) -> Result<String, ConfigError> {
        let fire_id = self
            .fire_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let Some(format) = format else {
            return Ok(fire_id);
        };

        let mut values = Wildcards::new().request_id(request_id).fire_id(fire_id);
        if let Some(today) = bluesky_today {
            values = values.bluesky_today(today);
        }
        wildcards::fill_timed(format, "run_id_format", &values)
    }
}
