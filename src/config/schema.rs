//! Option descriptor tree and the load-time walk over it.

use serde_json::{json, Map, Value};

use super::{display_path, ConfigError};

/// Predicate a user-supplied value must satisfy.
pub type Validator = fn(&Value) -> bool;

/// Descriptor for a single configuration setting.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    /// Value used when the user does not set the option.
    pub default: Value,
    /// Whether the option must end up with a non-null value.
    pub required: bool,
    /// Optional check applied to user-supplied, non-null values.
    pub validator: Option<Validator>,
    /// Documentation shown by `config docs`.
    pub help: &'static str,
    /// Value shown in the generated example document.
    pub example: Option<Value>,
    /// Whether the setting itself holds a JSON object.
    pub object_valued: bool,
}

impl OptionSpec {
    pub fn new(default: Value) -> Self {
        Self {
            default,
            required: false,
            validator: None,
            help: "",
            example: None,
            object_valued: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn help(mut self, help: &'static str) -> Self {
        self.help = help;
        self
    }

    pub fn example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn object_valued(mut self) -> Self {
        self.object_valued = true;
        self
    }

    /// The example if one was given, otherwise the default.
    pub fn example_value(&self) -> &Value {
        self.example.as_ref().unwrap_or(&self.default)
    }

    fn check(&self, value: &Value, keys: &[&str]) -> Result<(), ConfigError> {
        if value.is_object() && !self.object_valued {
            return Err(ConfigError::InvalidField(display_path(keys)));
        }
        if value.is_null() {
            return Ok(());
        }
        if let Some(validator) = self.validator {
            if !validator(value) {
                return Err(ConfigError::InvalidValue {
                    path: display_path(keys),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, value: Option<&Value>, keys: &[&str]) -> Result<Value, ConfigError> {
        match value {
            Some(v) if !v.is_null() => Ok(v.clone()),
            _ if self.required && self.default.is_null() => {
                Err(ConfigError::MissingField(display_path(keys)))
            }
            _ => Ok(self.default.clone()),
        }
    }
}

/// A node in the descriptor tree.
#[derive(Debug, Clone)]
pub enum SchemaNode {
    Leaf(OptionSpec),
    Group(Vec<(&'static str, SchemaNode)>),
}

fn leaf(spec: OptionSpec) -> SchemaNode {
    SchemaNode::Leaf(spec)
}

fn group(entries: Vec<(&'static str, SchemaNode)>) -> SchemaNode {
    SchemaNode::Group(entries)
}

fn is_bool(v: &Value) -> bool {
    v.is_boolean()
}

fn is_string(v: &Value) -> bool {
    v.is_string()
}

fn is_positive_int(v: &Value) -> bool {
    v.as_u64().is_some_and(|n| n > 0)
}

fn is_non_negative_int(v: &Value) -> bool {
    v.as_u64().is_some()
}

fn is_port(v: &Value) -> bool {
    v.as_u64().is_some_and(|n| n > 0 && n <= u64::from(u16::MAX))
}

fn is_string_list(v: &Value) -> bool {
    v.as_array()
        .is_some_and(|items| items.iter().all(Value::is_string))
}

fn is_non_empty_string_list(v: &Value) -> bool {
    is_string_list(v) && v.as_array().is_some_and(|items| !items.is_empty())
}

fn is_wait_strategy(v: &Value) -> bool {
    matches!(v.as_str(), Some("fixed") | Some("backoff"))
}

fn is_unpaired_policy(v: &Value) -> bool {
    matches!(v.as_str(), Some("truncate") | Some("error"))
}

fn is_efs_volumes(v: &Value) -> bool {
    v.as_array().is_some_and(|volumes| {
        volumes.iter().all(|pair| {
            pair.as_array()
                .is_some_and(|p| p.len() == 2 && p.iter().all(Value::is_string))
        })
    })
}

/// Builds the full descriptor tree, in documentation order.
pub fn schema() -> SchemaNode {
    group(vec![
        (
            "request_id_format",
            leaf(OptionSpec::new(Value::Null)
                .validator(is_string)
                .help(
                    "Used in the status, request and config file names, and in log and output \
                     file names. Defaults to the input file name with `.json` removed.\n\n\
                     Supported wildcards: {input_file_name}, {uuid} (8 characters), \
                     {utc_today} (%Y%m%d), {utc_now} (%Y%m%dT%H%M%S).",
                )
                .example(json!("bluesky-aws-{input_file_name}"))),
        ),
        (
            "run_id_format",
            leaf(OptionSpec::new(Value::Null)
                .validator(is_string)
                .help(
                    "Defaults to the fire id, or a fresh UUID if the fire has no id.\n\n\
                     Supported wildcards: {request_id}, {uuid} (8 characters), {fire_id}, \
                     {utc_today}, {utc_now}, {bluesky_today} (bluesky's 'today', defaulting \
                     to the current UTC date). strftime directives such as %Y-%m-%d are \
                     filled in with the current UTC time.",
                )
                .example(json!("{request_id}-{fire_id}"))),
        ),
        (
            "bluesky_version",
            leaf(OptionSpec::new(json!("v4.2.9"))
                .required()
                .validator(is_string)
                .help("A published bluesky docker image tag.")),
        ),
        (
            "unpaired_jobs",
            leaf(OptionSpec::new(json!("truncate"))
                .validator(is_unpaired_policy)
                .help(
                    "What to do with fires beyond the number of available instances: \
                     'truncate' runs as many as fit and records the rest as unknown; \
                     'error' refuses to start the run.",
                )),
        ),
        (
            "input",
            group(vec![(
                "wait",
                group(vec![
                    (
                        "strategy",
                        leaf(OptionSpec::new(json!("fixed"))
                            .validator(is_wait_strategy)
                            .help("'fixed' or 'backoff' (doubles the wait after each attempt).")),
                    ),
                    (
                        "time",
                        leaf(OptionSpec::new(json!(15 * 60))
                            .validator(is_non_negative_int)
                            .help("Seconds to wait before retrying input load.")),
                    ),
                    (
                        "max_attempts",
                        leaf(OptionSpec::new(json!(3))
                            .validator(is_positive_int)
                            .help("Max number of load attempts before aborting.")),
                    ),
                ]),
            )]),
        ),
        (
            "cleanup_output",
            leaf(OptionSpec::new(json!(true))
                .validator(is_bool)
                .help(
                    "Whether to delete output on the instance after publishing. Turning this \
                     off is only useful with existing instances, to inspect output after the run.",
                )),
        ),
        (
            "ssh_key",
            leaf(OptionSpec::new(Value::Null)
                .required()
                .validator(is_string)
                .help("Absolute path to the ssh key used to run commands on instances.")
                .example(json!("/home/foo/.ssh/id_rsa.pem"))),
        ),
        (
            "ssh_user",
            leaf(OptionSpec::new(json!("ubuntu"))
                .validator(is_string)
                .help("Login user on the instances.")),
        ),
        (
            "aws",
            group(vec![
                (
                    "iam_instance_profile",
                    group(vec![
                        (
                            "Arn",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_string)
                                .example(json!(
                                    "arn:aws:iam::abc-123:instance-profile/bluesky-aws-role"
                                ))),
                        ),
                        (
                            "Name",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_string)
                                .example(json!("bluesky-aws-role"))),
                        ),
                    ]),
                ),
                (
                    "region",
                    leaf(OptionSpec::new(Value::Null)
                        .validator(is_string)
                        .help("AWS region; defaults to the AWS CLI's own configuration.")
                        .example(json!("us-west-2"))),
                ),
                (
                    "credentials_file",
                    leaf(OptionSpec::new(Value::Null)
                        .validator(is_string)
                        .help(
                            "Local AWS credentials file copied to instances that lack one, so \
                             they can publish output. Not needed when the instance profile \
                             grants S3 access.",
                        )
                        .example(json!("/home/foo/.aws/credentials"))),
                ),
                (
                    "ec2",
                    group(vec![
                        (
                            "max_num_instances",
                            leaf(OptionSpec::new(Value::Null)
                                .validator(is_positive_int)
                                .help("The maximum number of new plus existing instances to use.")
                                .example(json!(50))),
                        ),
                        (
                            "image_name_prefix_format",
                            leaf(OptionSpec::new(json!("bluesky-aws-{request_id}"))
                                .validator(is_string)
                                .help(
                                    "Prefix for the name of each new instance. A short guid is \
                                     appended to avoid collisions, then the instance index. \
                                     Supports the {request_id} wildcard.",
                                )),
                        ),
                        (
                            "image_id",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_string)
                                .help("Image to launch instances from.")
                                .example(json!("ami-0123456789abcdef0"))),
                        ),
                        (
                            "instance_type",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_string)
                                .example(json!("t2.small"))),
                        ),
                        (
                            "key_pair_name",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_string)
                                .help("Name of the AWS key pair matching ssh_key.")
                                .example(json!("foo_id_rsa"))),
                        ),
                        (
                            "security_groups",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_non_empty_string_list)
                                .help("Security groups; at least one must allow ssh.")
                                .example(json!(["launch-wizard-1", "default"]))),
                        ),
                        (
                            "efs_volumes",
                            leaf(OptionSpec::new(Value::Null)
                                .validator(is_efs_volumes)
                                .help("EFS volumes to mount, as [\"<host>:/\", \"/local/mount/path/\"] pairs.")
                                .example(json!([[
                                    "fs-abc123.efs.us-west-2.amazonaws.com:/",
                                    "/Met/"
                                ]]))),
                        ),
                        (
                            "ebs",
                            group(vec![
                                (
                                    "volume_size",
                                    leaf(OptionSpec::new(json!(8))
                                        .validator(is_positive_int)
                                        .help("EBS volume size in GB.")),
                                ),
                                (
                                    "device_name",
                                    leaf(OptionSpec::new(json!("/dev/sda1"))
                                        .validator(is_string)
                                        .help("EBS volume device name.")),
                                ),
                            ]),
                        ),
                        (
                            "minutes_until_auto_shutdown",
                            leaf(OptionSpec::new(Value::Null)
                                .validator(is_positive_int)
                                .help(
                                    "Minutes after launch at which new instances shut \
                                     themselves down; null disables the safety net.",
                                )
                                .example(json!(120))),
                        ),
                    ]),
                ),
                (
                    "s3",
                    group(vec![
                        (
                            "bucket_name",
                            leaf(OptionSpec::new(Value::Null)
                                .required()
                                .validator(is_string)
                                .help("Bucket used for status, logs and output.")
                                .example(json!("bluesky-aws"))),
                        ),
                        (
                            "output_path",
                            leaf(OptionSpec::new(json!("output"))
                                .required()
                                .validator(is_string)
                                .help("Key prefix for output tarballs.")),
                        ),
                    ]),
                ),
            ]),
        ),
        (
            "bluesky",
            group(vec![
                (
                    "docker_image",
                    leaf(OptionSpec::new(json!("pnwairfire/bluesky"))
                        .validator(is_string)
                        .help("Docker repository of the bluesky image; tagged with bluesky_version.")),
                ),
                (
                    "today",
                    leaf(OptionSpec::new(Value::Null)
                        .validator(is_string)
                        .help("bluesky's 'today'; defaults to the current day.")
                        .example(json!("2020-03-01"))),
                ),
                (
                    "modules",
                    leaf(OptionSpec::new(Value::Null)
                        .required()
                        .validator(is_non_empty_string_list)
                        .help("bluesky modules to run; 'export' is always appended.")
                        .example(json!(["fuelbeds", "consumption", "emissions"]))),
                ),
                (
                    "config_file",
                    leaf(OptionSpec::new(Value::Null)
                        .validator(is_string)
                        .help("bluesky config file, formatted {\"config\": {...}}.")
                        .example(json!("/path/to/bluesky-config.json"))),
                ),
                (
                    "config",
                    leaf(OptionSpec::new(json!({}))
                        .object_valued()
                        .help("bluesky config settings overriding those in config_file.")),
                ),
                (
                    "seconds_between_completion_checks",
                    leaf(OptionSpec::new(json!(30))
                        .validator(is_positive_int)
                        .help("Seconds to wait between checks for run completion.")),
                ),
                (
                    "max_run_minutes",
                    leaf(OptionSpec::new(Value::Null)
                        .validator(is_positive_int)
                        .help(
                            "Give up on a run after this many minutes and record it as \
                             unknown; null waits indefinitely.",
                        )
                        .example(json!(240))),
                ),
            ]),
        ),
        (
            "notifications",
            group(vec![(
                "email",
                group(vec![
                    ("enabled", leaf(OptionSpec::new(json!(false)).validator(is_bool))),
                    ("recipients", leaf(OptionSpec::new(json!([])).validator(is_string_list))),
                    (
                        "sender",
                        leaf(OptionSpec::new(json!("blueskyaws@blueskyaws")).validator(is_string)),
                    ),
                    (
                        "subject",
                        leaf(OptionSpec::new(json!("BlueSky AWS Output Status")).validator(is_string)),
                    ),
                    ("smtp_server", leaf(OptionSpec::new(json!("localhost")).validator(is_string))),
                    ("smtp_port", leaf(OptionSpec::new(json!(1025)).validator(is_port))),
                    ("smtp_starttls", leaf(OptionSpec::new(json!(false)).validator(is_bool))),
                    (
                        "username",
                        leaf(OptionSpec::new(Value::Null)
                            .validator(is_string)
                            .example(json!("joedoe"))),
                    ),
                    (
                        "password",
                        leaf(OptionSpec::new(Value::Null)
                            .validator(is_string)
                            .example(json!("123abc!"))),
                    ),
                ]),
            )]),
        ),
    ])
}

/// Validates a user document against the schema and fills in defaults.
///
/// User values are checked first (unknown keys, shape, validators) across
/// the whole document; missing required settings are reported afterwards,
/// in schema order.
pub fn resolve(user: &Value) -> Result<Value, ConfigError> {
    let root = schema();
    let empty = Map::new();
    let user = match user {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(ConfigError::InvalidField("(root)".to_string())),
    };
    let mut keys = Vec::new();
    check_group(&root, user, &mut keys)?;
    fill_group(&root, Some(user), &mut keys).map(Value::Object)
}

fn entries(node: &SchemaNode) -> &[(&'static str, SchemaNode)] {
    match node {
        SchemaNode::Group(entries) => entries,
        SchemaNode::Leaf(_) => &[],
    }
}

fn check_group<'a>(
    node: &SchemaNode,
    user: &'a Map<String, Value>,
    keys: &mut Vec<&'a str>,
) -> Result<(), ConfigError> {
    let known = entries(node);
    let mut unknown: Vec<&str> = user
        .keys()
        .map(String::as_str)
        .filter(|k| !known.iter().any(|(name, _)| name == k))
        .collect();
    if !unknown.is_empty() {
        unknown.sort_unstable();
        let joined = unknown.join(", ");
        let mut path: Vec<&str> = keys.clone();
        path.push(&joined);
        return Err(ConfigError::InvalidField(display_path(&path)));
    }

    for (key, value) in user {
        let Some((_, child)) = known.iter().find(|(name, _)| *name == key.as_str()) else {
            continue;
        };
        keys.push(key.as_str());
        match (child, value) {
            (SchemaNode::Leaf(spec), v) => spec.check(v, keys)?,
            (SchemaNode::Group(_), Value::Object(map)) => check_group(child, map, keys)?,
            (SchemaNode::Group(_), Value::Null) => {}
            (SchemaNode::Group(_), _) => return Err(ConfigError::InvalidField(display_path(keys))),
        }
        keys.pop();
    }
    Ok(())
}

fn fill_group<'a>(
    node: &'a SchemaNode,
    user: Option<&Map<String, Value>>,
    keys: &mut Vec<&'a str>,
) -> Result<Map<String, Value>, ConfigError> {
    let mut out = Map::new();
    for (key, child) in entries(node) {
        keys.push(*key);
        let provided = user.and_then(|m| m.get(*key));
        let value = match child {
            SchemaNode::Leaf(spec) => spec.resolve(provided, keys)?,
            SchemaNode::Group(_) => {
                Value::Object(fill_group(child, provided.and_then(Value::as_object), keys)?)
            }
        };
        out.insert((*key).to_string(), value);
        keys.pop();
    }
    Ok(out)
}

/// Visits every leaf with its key path, in schema order.
pub fn walk_leaves<'a>(node: &'a SchemaNode, visit: &mut dyn FnMut(&[&'a str], &'a OptionSpec)) {
    fn go<'a>(
        node: &'a SchemaNode,
        keys: &mut Vec<&'a str>,
        visit: &mut dyn FnMut(&[&'a str], &'a OptionSpec),
    ) {
        match node {
            SchemaNode::Leaf(spec) => visit(keys, spec),
            SchemaNode::Group(entries) => {
                for (key, child) in entries {
                    keys.push(*key);
                    go(child, keys, visit);
                    keys.pop();
                }
            }
        }
    }
    go(node, &mut Vec::new(), visit);
}
