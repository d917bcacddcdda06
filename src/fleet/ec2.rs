//! EC2 provisioning through the `aws` command line client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::{InstanceState, InstanceSummary, Provisioner, ShutdownMode, Worker};
use crate::aws::{args, AwsCli};
use crate::config::{Ec2Settings, IamInstanceProfile};
use crate::error::ProvisionError;

/// Launches and tears down EC2 instances.
#[derive(Debug, Clone)]
pub struct Ec2Provisioner {
    cli: AwsCli,
    ec2: Ec2Settings,
    profile: IamInstanceProfile,
}

impl Ec2Provisioner {
    pub fn new(cli: AwsCli, ec2: Ec2Settings, profile: IamInstanceProfile) -> Self {
        Self { cli, ec2, profile }
    }

    fn run_instances_args(&self, name: &str) -> Vec<String> {
        let block_devices = json!([{
            "DeviceName": self.ec2.ebs.device_name,
            "Ebs": {"VolumeSize": self.ec2.ebs.volume_size},
        }]);
        let mut a = args([
            "ec2",
            "run-instances",
            "--image-id",
            self.ec2.image_id.as_str(),
            "--instance-type",
            self.ec2.instance_type.as_str(),
            "--key-name",
            self.ec2.key_pair_name.as_str(),
            "--count",
            "1",
            "--instance-initiated-shutdown-behavior",
            "terminate",
        ]);
        a.push("--iam-instance-profile".to_string());
        a.push(format!("Name={}", self.profile.name));
        a.push("--security-groups".to_string());
        a.extend(self.ec2.security_groups.iter().cloned());
        a.push("--block-device-mappings".to_string());
        a.push(block_devices.to_string());
        a.push("--tag-specifications".to_string());
        a.push(format!("ResourceType=instance,Tags=[{{Key=Name,Value={name}}}]"));
        a
    }

    async fn launch_one(&self, name: &str) -> Result<String, ProvisionError> {
        let response = self
            .cli
            .run_json(&self.run_instances_args(name))
            .await
            .map_err(|e| ProvisionError::LaunchFailed(format!("{name}: {e}")))?;
        let id = response
            .pointer("/Instances/0/InstanceId")
            .and_then(Value::as_str)
            .ok_or_else(|| ProvisionError::LaunchFailed(format!("{name}: no instance id returned")))?;
        info!(name = %name, instance = %id, "Launched instance");
        Ok(id.to_string())
    }

    /// Describe the given instances, or every instance matching `filters`.
    pub async fn describe(
        &self,
        ids: &[String],
        filters: &[String],
    ) -> Result<Vec<InstanceSummary>, ProvisionError> {
        let mut a = args(["ec2", "describe-instances"]);
        if !ids.is_empty() {
            a.push("--instance-ids".to_string());
            a.extend(ids.iter().cloned());
        }
        if !filters.is_empty() {
            a.push("--filters".to_string());
            a.extend(filters.iter().cloned());
        }
        let response = self.cli.run_json(&a).await.map_err(ProvisionError::Cli)?;
        Ok(parse_instances(&response))
    }

    /// All running instances in the region.
    pub async fn list_running(&self) -> Result<Vec<InstanceSummary>, ProvisionError> {
        self.describe(&[], &args(["Name=instance-state-name,Values=running"]))
            .await
    }

    async fn wait_running(&self, ids: &[String]) -> Result<(), ProvisionError> {
        let mut a = args(["ec2", "wait", "instance-running", "--instance-ids"]);
        a.extend(ids.iter().cloned());
        let output = self.cli.run(&a).await?;
        if output.success {
            Ok(())
        } else {
            Err(ProvisionError::LaunchFailed(format!(
                "instances never reached running: {}",
                output.stderr
            )))
        }
    }

    /// Stop or terminate instances by id.
    pub async fn shutdown_ids(
        &self,
        ids: &[String],
        mode: ShutdownMode,
    ) -> Result<(), ProvisionError> {
        if ids.is_empty() {
            return Ok(());
        }
        let action = match mode {
            ShutdownMode::Stop => "stop-instances",
            ShutdownMode::Terminate => "terminate-instances",
        };
        let mut a = args(["ec2", action, "--instance-ids"]);
        a.extend(ids.iter().cloned());
        self.cli
            .run_json(&a)
            .await
            .map_err(ProvisionError::ShutdownFailed)?;
        info!(action, instances = ?ids, "Shut down instances");
        Ok(())
    }

    async fn to_workers(
        &self,
        ids: &[String],
        names: &[String],
    ) -> Result<Vec<Worker>, ProvisionError> {
        let described = self.describe(ids, &[]).await?;
        ids.iter()
            .zip(names)
            .map(|(id, name)| {
                let summary = described.iter().find(|s| &s.id == id).ok_or_else(|| {
                    ProvisionError::DescribeFailed {
                        instance: id.clone(),
                        reason: "not returned by describe-instances".to_string(),
                    }
                })?;
                let address = summary.address().ok_or_else(|| ProvisionError::DescribeFailed {
                    instance: id.clone(),
                    reason: "instance has no IP address".to_string(),
                })?;
                Ok(Worker::provisioned(id, name, address, summary.state))
            })
            .collect()
    }
}

#[async_trait]
impl Provisioner for Ec2Provisioner {
    async fn launch(&self, names: &[String]) -> Result<Vec<Worker>, ProvisionError> {
        let results = join_all(names.iter().map(|n| self.launch_one(n))).await;

        let mut ids = Vec::new();
        let mut launched_names = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(id) => {
                    ids.push(id);
                    launched_names.push(name.clone());
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        if ids.is_empty() {
            return Err(ProvisionError::LaunchFailed(failures.join("; ")));
        }

        let settled = match self.wait_running(&ids).await {
            Ok(()) => self.to_workers(&ids, &launched_names).await,
            Err(e) => Err(e),
        };

        match settled {
            Ok(workers) if failures.is_empty() => Ok(workers),
            Ok(workers) => Err(ProvisionError::Partial {
                created: workers,
                message: failures.join("; "),
            }),
            Err(e) => {
                error!(error = %e, "Launched instances did not become usable");
                // Still hand back what exists so it gets terminated.
                let created = ids
                    .iter()
                    .zip(&launched_names)
                    .map(|(id, name)| Worker::provisioned(id, name, "", InstanceState::Pending))
                    .collect();
                Err(ProvisionError::Partial {
                    created,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn reload(&self, worker: &Worker) -> Result<InstanceState, ProvisionError> {
        let described = self
            .describe(std::slice::from_ref(&worker.id), &[])
            .await
            .map_err(|e| ProvisionError::DescribeFailed {
                instance: worker.id.clone(),
                reason: e.to_string(),
            })?;
        let state = described
            .iter()
            .find(|s| s.id == worker.id)
            .map(|s| s.state)
            .unwrap_or(InstanceState::Terminated);
        debug!(instance = %worker, state = %state, "Reloaded instance");
        Ok(state)
    }

    async fn shutdown(&self, workers: &[Worker], mode: ShutdownMode) -> Result<(), ProvisionError> {
        let ids: Vec<String> = workers.iter().map(|w| w.id.clone()).collect();
        self.shutdown_ids(&ids, mode).await
    }
}

/// Flatten a `describe-instances` response.
pub fn parse_instances(response: &Value) -> Vec<InstanceSummary> {
    let reservations = response
        .get("Reservations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    reservations
        .iter()
        .filter_map(|r| r.get("Instances").and_then(Value::as_array))
        .flatten()
        .filter_map(|i| {
            let id = i.get("InstanceId")?.as_str()?.to_string();
            let name = i
                .get("Tags")
                .and_then(Value::as_array)
                .and_then(|tags| {
                    tags.iter()
                        .find(|t| t.get("Key").and_then(Value::as_str) == Some("Name"))
                })
                .and_then(|t| t.get("Value"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let state = i
                .pointer("/State/Name")
                .and_then(Value::as_str)
                .map(InstanceState::parse)
                .unwrap_or(InstanceState::Unknown);
            let launch_time = i
                .get("LaunchTime")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));
            let text = |key: &str| i.get(key).and_then(Value::as_str).map(str::to_string);
            Some(InstanceSummary {
                id,
                name,
                state,
                launch_time,
                public_ip: text("PublicIpAddress"),
                private_ip: text("PrivateIpAddress"),
            })
        })
        .collect()
}
