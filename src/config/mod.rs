//! Orchestrator configuration.
//!
//! Configuration is described by a static tree of option descriptors
//! ([`schema`]). A user document (JSON or YAML) is walked against that tree
//! once at load time: unknown keys, malformed values and missing required
//! settings are rejected with a [`ConfigError`] naming the offending path,
//! and everything left unset is filled from the descriptor defaults. The
//! filled tree is then deserialized into the immutable, typed [`Config`].
//!
//! ```rust,ignore
//! use firefleet::config::Config;
//!
//! let config = Config::load("fleet.json")?;
//! assert_eq!(config.bluesky_version, "v4.2.9");
//! ```

pub mod docs;
pub mod schema;
pub mod settings;
pub mod wildcards;

use thiserror::Error;

pub use docs::{example_document, ConfigDocs};
pub use schema::{OptionSpec, SchemaNode};
pub use settings::{
    AwsSettings, BlueskySettings, Config, EbsSettings, Ec2Settings, EmailSettings,
    IamInstanceProfile, InputSettings, NotificationSettings, S3Settings, UnpairedJobsPolicy,
    WaitSettings, WaitStrategy,
};
pub use wildcards::Wildcards;

/// Errors that can occur while loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown key(s), or a group given where a value was expected (or the reverse).
    #[error("Invalid config field {0}")]
    InvalidField(String),

    /// A value failed its option's validator.
    #[error("Invalid config setting {path} = {value}")]
    InvalidValue { path: String, value: String },

    /// A required setting was not provided and has no default.
    #[error("Missing required config setting {0}")]
    MissingField(String),

    /// A template referenced a wildcard that the setting does not support.
    #[error("Invalid wildcard, '{wildcard}', used in '{setting}' config field")]
    InvalidWildcard { wildcard: String, setting: String },

    /// A template had an unterminated `{`.
    #[error("Malformed template '{template}' in '{setting}' config field")]
    MalformedTemplate { template: String, setting: String },

    /// A template contained an invalid strftime directive.
    #[error("Invalid time format '{template}' in '{setting}' config field")]
    InvalidTimeFormat { template: String, setting: String },

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Joins a key path the way error messages and docs display it.
pub(crate) fn display_path(keys: &[&str]) -> String {
    keys.join(" > ")
}
