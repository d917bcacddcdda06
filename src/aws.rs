//! Thin wrapper around the `aws` command line client.
//!
//! EC2 and S3 operations shell out to the CLI rather than linking an SDK, so
//! credentials, profiles and regions resolve exactly as they do for the
//! operator's own `aws` invocations.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;

/// Output of a finished `aws` invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Invokes the `aws` binary with a fixed region and profile.
#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region,
            profile: std::env::var("AWS_PROFILE").ok(),
        }
    }

    /// Use a different executable, e.g. a wrapper script.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a subcommand, capturing its output.
    pub async fn run(&self, args: &[String]) -> std::io::Result<CliOutput> {
        tracing::debug!(args = ?args, "Running aws cli");
        let output = self.command(args).output().await?;
        Ok(CliOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            success: output.status.success(),
        })
    }

    /// Run a subcommand with `--output json` and parse what it prints.
    ///
    /// Returns the CLI's error stream as the error when it exits non-zero.
    pub async fn run_json(&self, args: &[String]) -> Result<Value, String> {
        let mut args = args.to_vec();
        args.extend(["--output".to_string(), "json".to_string()]);
        let output = self.run(&args).await.map_err(|e| e.to_string())?;
        if !output.success {
            return Err(output.stderr);
        }
        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output.stdout).map_err(|e| e.to_string())
    }
}

/// Build an owned argument list from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
