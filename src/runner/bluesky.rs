//! The bluesky simulation payload: its configuration and command line.

use std::path::Path;

use serde_json::{json, Map, Value};

use super::RunnerError;
use crate::remote::shell_quote;

/// Container path the run directory is mounted at.
const CONTAINER_DIR: &str = "/data/bluesky/";

/// Export settings every run uses, overriding anything user supplied.
pub fn export_config() -> Value {
    json!({
        "modes": ["localsave"],
        "extra_exports": ["dispersion", "visualization"],
        "localsave": {
            "handle_existing": "replace",
            "dest_dir": "/data/bluesky/exports/"
        }
    })
}

/// Merge bluesky configs, later layers winning per top-level key: the
/// config file, inline overrides, the input's run config, then the fixed
/// export block.
pub fn merge_config(file: &Value, inline: &Value, run_config: &Value) -> Value {
    let mut merged = Map::new();
    for layer in [file, inline, run_config] {
        if let Some(map) = layer.as_object() {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged.insert("export".to_string(), export_config());
    Value::Object(merged)
}

/// Read the `config` section of a bluesky config file.
pub fn load_config_file(path: &Path) -> Result<Value, RunnerError> {
    let text = std::fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&text)?;
    match document.get("config") {
        Some(config @ Value::Object(_)) => Ok(config.clone()),
        Some(_) => Err(RunnerError::InvalidConfig(format!(
            "'config' in {} is not an object",
            path.display()
        ))),
        None => Ok(Value::Object(Map::new())),
    }
}

/// Container name for a run; also the marker polled for in the process list.
pub fn container_name(run_id: &str) -> String {
    let sanitized: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("bluesky-{sanitized}")
}

/// Everything needed to form the pipeline command.
#[derive(Debug, Clone)]
pub struct PipelineSpec<'a> {
    pub host_dir: &'a str,
    pub image: &'a str,
    pub run_id: &'a str,
    pub today: Option<&'a str>,
    pub modules: &'a [String],
}

/// The docker command that runs bluesky against the files in `host_dir`.
pub fn pipeline_command(spec: &PipelineSpec<'_>) -> String {
    let mut modules: Vec<String> = spec
        .modules
        .iter()
        .filter(|m| *m != "export")
        .map(|m| shell_arg(m))
        .collect();
    modules.push("export".to_string());

    let volume = format!("{}:{CONTAINER_DIR}", spec.host_dir.trim_end_matches('/'));
    let mut cmd = format!(
        "docker run --rm --name {name} -v {volume} {image} \
         bsp --log-level=DEBUG --run-id={run_id}",
        name = container_name(spec.run_id),
        volume = shell_arg(&volume),
        image = shell_arg(spec.image),
        run_id = shell_arg(spec.run_id),
    );
    if let Some(today) = spec.today {
        cmd.push_str(&format!(" --today={}", shell_arg(today)));
    }
    cmd.push_str(&format!(
        " -c {CONTAINER_DIR}config.json -i {CONTAINER_DIR}input.json \
         -o {CONTAINER_DIR}output.json --log-file {CONTAINER_DIR}output.log {}",
        modules.join(" ")
    ));
    cmd
}

/// Quote `arg` for the remote shell unless it is plainly safe.
fn shell_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.,:/=@+".contains(c));
    if plain {
        arg.to_string()
    } else {
        shell_quote(arg)
    }
}

/// The error bluesky recorded in its output, if any.
pub fn run_error(output: &Value) -> Option<String> {
    fn message(error: &Value) -> Option<String> {
        match error {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => Some(
                map.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            ),
            other => Some(other.to_string()),
        }
    }

    if let Some(msg) = output.get("error").and_then(message) {
        return Some(msg);
    }
    output
        .get("fires")
        .and_then(Value::as_array)?
        .iter()
        .find_map(|fire| fire.get("error").and_then(message))
}
