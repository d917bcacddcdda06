//! Typed, immutable view of a resolved configuration document.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::schema;
use super::wildcards::{self, Wildcards};
use super::ConfigError;

/// How long to wait between input load attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    Fixed,
    Backoff,
}

/// What to do with jobs beyond the number of available workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpairedJobsPolicy {
    #[default]
    Truncate,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSettings {
    pub strategy: WaitStrategy,
    pub time: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSettings {
    pub wait: WaitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamInstanceProfile {
    #[serde(rename = "Arn")]
    pub arn: String,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EbsSettings {
    pub volume_size: u32,
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ec2Settings {
    pub max_num_instances: Option<usize>,
    pub image_name_prefix_format: String,
    pub image_id: String,
    pub instance_type: String,
    pub key_pair_name: String,
    pub security_groups: Vec<String>,
    /// `(remote filesystem, local mount point)` pairs.
    pub efs_volumes: Option<Vec<(String, String)>>,
    pub ebs: EbsSettings,
    pub minutes_until_auto_shutdown: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket_name: String,
    pub output_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    pub iam_instance_profile: IamInstanceProfile,
    pub region: Option<String>,
    pub credentials_file: Option<String>,
    pub ec2: Ec2Settings,
    pub s3: S3Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskySettings {
    pub docker_image: String,
    pub today: Option<String>,
    pub modules: Vec<String>,
    pub config_file: Option<String>,
    pub config: Value,
    pub seconds_between_completion_checks: u64,
    pub max_run_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub enabled: bool,
    pub recipients: Vec<String>,
    pub sender: String,
    pub subject: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub email: EmailSettings,
}

/// The resolved configuration of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub request_id_format: Option<String>,
    pub run_id_format: Option<String>,
    pub bluesky_version: String,
    pub unpaired_jobs: UnpairedJobsPolicy,
    pub input: InputSettings,
    pub cleanup_output: bool,
    pub ssh_key: String,
    pub ssh_user: String,
    pub aws: AwsSettings,
    pub bluesky: BlueskySettings,
    pub notifications: NotificationSettings,
}

/// Placeholder written over secrets when the configuration is logged or published.
const REDACTED: &str = "***";

impl Config {
    /// Load a configuration file. `.yaml`/`.yml` files are parsed as YAML,
    /// everything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        let user: Value = if is_yaml {
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        Self::from_value(&user)
    }

    /// Validate a user document, fill defaults and build the typed config.
    pub fn from_value(user: &Value) -> Result<Self, ConfigError> {
        let resolved = schema::resolve(user)?;
        let config: Config =
            serde_json::from_value(resolved).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate_templates()?;
        config.log_settings();
        Ok(config)
    }

    /// Reject templates that reference wildcards their setting does not support.
    fn validate_templates(&self) -> Result<(), ConfigError> {
        if let Some(format) = &self.request_id_format {
            wildcards::check(format, "request_id_format", wildcards::REQUEST_ID)?;
        }
        if let Some(format) = &self.run_id_format {
            wildcards::check(format, "run_id_format", wildcards::RUN_ID)?;
            wildcards::check_time_format(format, "run_id_format")?;
        }
        wildcards::check(
            &self.aws.ec2.image_name_prefix_format,
            "aws > ec2 > image_name_prefix_format",
            wildcards::NAME_PREFIX,
        )?;
        Ok(())
    }

    /// Compute the request id, falling back to the input file name without `.json`.
    pub fn request_id(&self, input_file_name: &str) -> Result<String, ConfigError> {
        let base = input_file_name
            .strip_suffix(".json")
            .unwrap_or(input_file_name)
            .to_string();
        match &self.request_id_format {
            Some(format) => wildcards::fill(
                format,
                "request_id_format",
                &Wildcards::new().input_file_name(base),
            ),
            None => Ok(base),
        }
    }

    /// Name prefix for new instances of `request_id`.
    pub fn name_prefix(&self, request_id: &str) -> Result<String, ConfigError> {
        wildcards::fill(
            &self.aws.ec2.image_name_prefix_format,
            "aws > ec2 > image_name_prefix_format",
            &Wildcards::new().request_id(request_id),
        )
    }

    /// The full bluesky docker image reference.
    pub fn bluesky_image(&self) -> String {
        format!("{}:{}", self.bluesky.docker_image, self.bluesky_version)
    }

    /// The configuration as a JSON tree with secrets replaced.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        for pointer in SECRETS {
            if let Some(slot) = value.pointer_mut(pointer) {
                if !slot.is_null() {
                    *slot = Value::String(REDACTED.to_string());
                }
            }
        }
        value
    }

    /// Emit the effective configuration at debug level, one line per setting.
    pub fn log_settings(&self) {
        fn walk(prefix: &mut Vec<String>, value: &Value) {
            match value {
                Value::Object(map)
                    if !map.is_empty() && prefix.last().map(String::as_str) != Some("config") =>
                {
                    for (key, child) in map {
                        prefix.push(key.clone());
                        walk(prefix, child);
                        prefix.pop();
                    }
                }
                _ => debug!(setting = %prefix.join(" > "), value = %value, "Config"),
            }
        }
        walk(&mut Vec::new(), &self.redacted());
    }
}

/// JSON pointers of settings that never appear in logs or published copies.
const SECRETS: &[&str] = &[
    "/ssh_key",
    "/aws/iam_instance_profile/Arn",
    "/aws/iam_instance_profile/Name",
    "/aws/ec2/key_pair_name",
    "/notifications/email/username",
    "/notifications/email/password",
];
