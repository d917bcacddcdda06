//! `{name}` placeholder substitution for id and name templates.
//!
//! `{{` and `}}` produce literal braces. Each templated setting supports a
//! fixed set of wildcard names; anything else is rejected when the
//! configuration is loaded.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ConfigError;

pub const REQUEST_ID: &[&str] = &["input_file_name", "uuid", "utc_today", "utc_now"];
pub const RUN_ID: &[&str] = &[
    "request_id",
    "uuid",
    "fire_id",
    "utc_today",
    "utc_now",
    "bluesky_today",
];
pub const NAME_PREFIX: &[&str] = &["request_id"];

/// Values available for substitution.
#[derive(Debug, Clone)]
pub struct Wildcards {
    now: DateTime<Utc>,
    request_id: Option<String>,
    input_file_name: Option<String>,
    fire_id: Option<String>,
    bluesky_today: Option<String>,
}

impl Default for Wildcards {
    fn default() -> Self {
        Self::new()
    }
}

impl Wildcards {
    pub fn new() -> Self {
        Self {
            now: Utc::now(),
            request_id: None,
            input_file_name: None,
            fire_id: None,
            bluesky_today: None,
        }
    }

    /// Pin the clock used for `utc_today`, `utc_now` and strftime directives.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn request_id(mut self, value: impl Into<String>) -> Self {
        self.request_id = Some(value.into());
        self
    }

    pub fn input_file_name(mut self, value: impl Into<String>) -> Self {
        self.input_file_name = Some(value.into());
        self
    }

    pub fn fire_id(mut self, value: impl Into<String>) -> Self {
        self.fire_id = Some(value.into());
        self
    }

    pub fn bluesky_today(mut self, value: impl Into<String>) -> Self {
        self.bluesky_today = Some(value.into());
        self
    }

    fn value(&self, name: &str) -> Option<String> {
        match name {
            "uuid" => Some(short_uuid()),
            "utc_today" => Some(self.now.format("%Y%m%d").to_string()),
            "utc_now" => Some(self.now.format("%Y%m%dT%H%M%S").to_string()),
            "bluesky_today" => Some(
                self.bluesky_today
                    .clone()
                    .unwrap_or_else(|| self.now.format("%Y%m%d").to_string()),
            ),
            "request_id" => self.request_id.clone(),
            "input_file_name" => self.input_file_name.clone(),
            "fire_id" => self.fire_id.clone(),
            _ => None,
        }
    }
}

/// First eight hex characters of a fresh v4 UUID.
pub fn short_uuid() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

enum Segment<'a> {
    Literal(&'a str),
    Wildcard(&'a str),
}

fn parse<'a>(template: &'a str, setting: &str) -> Result<Vec<Segment<'a>>, ConfigError> {
    let mut segments = Vec::new();
    let mut rest = template;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("{{") {
            segments.push(Segment::Literal("{"));
            rest = after;
        } else if let Some(after) = rest.strip_prefix("}}") {
            segments.push(Segment::Literal("}"));
            rest = after;
        } else if let Some(after) = rest.strip_prefix('{') {
            let end = after.find('}').ok_or_else(|| ConfigError::MalformedTemplate {
                template: template.to_string(),
                setting: setting.to_string(),
            })?;
            segments.push(Segment::Wildcard(&after[..end]));
            rest = &after[end + 1..];
        } else {
            let end = rest.find(['{', '}']).map_or(rest.len(), |i| i.max(1));
            segments.push(Segment::Literal(&rest[..end]));
            rest = &rest[end..];
        }
    }
    Ok(segments)
}

/// Check that `template` only uses wildcards from `allowed`.
pub fn check(template: &str, setting: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    for segment in parse(template, setting)? {
        if let Segment::Wildcard(name) = segment {
            if !allowed.contains(&name) {
                return Err(ConfigError::InvalidWildcard {
                    wildcard: name.to_string(),
                    setting: setting.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Substitute every wildcard in `template`.
pub fn fill(template: &str, setting: &str, wildcards: &Wildcards) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    for segment in parse(template, setting)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Wildcard(name) => {
                let value = wildcards
                    .value(name)
                    .ok_or_else(|| ConfigError::InvalidWildcard {
                        wildcard: name.to_string(),
                        setting: setting.to_string(),
                    })?;
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

fn time_items<'a>(template: &'a str, setting: &str) -> Result<Vec<Item<'a>>, ConfigError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::InvalidTimeFormat {
            template: template.to_string(),
            setting: setting.to_string(),
        });
    }
    Ok(items)
}

/// Check that any strftime directives in `template` are valid.
pub fn check_time_format(template: &str, setting: &str) -> Result<(), ConfigError> {
    time_items(template, setting).map(|_| ())
}

/// Apply strftime directives using the wildcard clock, then substitute wildcards.
pub fn fill_timed(
    template: &str,
    setting: &str,
    wildcards: &Wildcards,
) -> Result<String, ConfigError> {
    let items = time_items(template, setting)?;
    let timed = wildcards.now.format_with_items(items.iter()).to_string();
    fill(&timed, setting, wildcards)
}
