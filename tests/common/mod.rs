//! In-memory collaborators shared by the integration tests.
//!
//! Every fake records the calls it receives so tests can assert on what the
//! pool, runners and orchestrator asked for.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use firefleet::config::Config;
use firefleet::error::{ProvisionError, RemoteError, StorageError};
use firefleet::fleet::{
    AutoShutdownScheduler, Initializer, InstanceState, PoolConfig, PoolServices, Provisioner,
    ShutdownMode, Worker,
};
use firefleet::notify::Notifier;
use firefleet::remote::{CommandOutput, RemoteSession, RemoteTransport};
use firefleet::status::{RunStatus, StatusDocument, StatusSink};
use firefleet::storage::ObjectStore;

// ============================================================================
// Configuration
// ============================================================================

pub fn config_json() -> Value {
    json!({
        "ssh_key": "/home/me/.ssh/id_rsa.pem",
        "input": {"wait": {"strategy": "fixed", "time": 0, "max_attempts": 1}},
        "aws": {
            "iam_instance_profile": {"Arn": "arn:aws:iam::1:instance-profile/r", "Name": "r"},
            "ec2": {
                "image_id": "ami-123abc",
                "instance_type": "t2.nano",
                "key_pair_name": "kp",
                "security_groups": ["ssh"]
            },
            "s3": {"bucket_name": "bluesky-aws"}
        },
        "bluesky": {
            "modules": ["fuelbeds", "consumption"],
            "seconds_between_completion_checks": 1
        }
    })
}

/// Build a config from [`config_json`] after applying `edit`.
pub fn config_with(edit: impl FnOnce(&mut Value)) -> Config {
    let mut value = config_json();
    edit(&mut value);
    Config::from_value(&value).unwrap()
}

pub fn fast_pool_config() -> PoolConfig {
    let mut config = PoolConfig::new("bluesky-aws-test");
    config.launch_poll_interval = Duration::from_millis(10);
    config.launch_wait_attempts = 200;
    config
}

// ============================================================================
// Fleet
// ============================================================================

#[derive(Default)]
pub struct FakeProvisioner {
    pub launches: Mutex<Vec<Vec<String>>>,
    pub shutdowns: Mutex<Vec<(Vec<String>, ShutdownMode)>>,
    states: Mutex<HashMap<String, InstanceState>>,
    /// Reload fails for these instance ids.
    pub unreachable: Mutex<HashSet<String>>,
    /// Create this many instances, then fail the launch.
    fail_after: Option<usize>,
    gate: Option<Arc<Notify>>,
    pub launch_started: Arc<Notify>,
    counter: AtomicUsize,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(created: usize) -> Self {
        Self {
            fail_after: Some(created),
            ..Self::default()
        }
    }

    /// A provisioner whose launch blocks until the returned gate is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                gate: Some(gate.clone()),
                ..Self::default()
            },
            gate,
        )
    }

    pub fn launched_names(&self) -> Vec<String> {
        self.launches.lock().unwrap().concat()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.shutdowns
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, mode)| *mode == ShutdownMode::Terminate)
            .flat_map(|(ids, _)| ids.clone())
            .collect()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdowns.lock().unwrap().len()
    }

    pub fn state_of(&self, id: &str) -> Option<InstanceState> {
        self.states.lock().unwrap().get(id).copied()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn launch(&self, names: &[String]) -> Result<Vec<Worker>, ProvisionError> {
        self.launches.lock().unwrap().push(names.to_vec());
        self.launch_started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let limit = self.fail_after.unwrap_or(names.len()).min(names.len());
        let mut created = Vec::new();
        for name in &names[..limit] {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("i-{n:04}");
            self.states
                .lock()
                .unwrap()
                .insert(id.clone(), InstanceState::Running);
            created.push(Worker::provisioned(
                id,
                name.clone(),
                format!("10.1.0.{n}"),
                InstanceState::Running,
            ));
        }

        if limit < names.len() {
            return Err(ProvisionError::Partial {
                created,
                message: "InsufficientInstanceCapacity".to_string(),
            });
        }
        Ok(created)
    }

    async fn reload(&self, worker: &Worker) -> Result<InstanceState, ProvisionError> {
        if self.unreachable.lock().unwrap().contains(&worker.id) {
            return Err(ProvisionError::DescribeFailed {
                instance: worker.id.clone(),
                reason: "RequestLimitExceeded".to_string(),
            });
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(&worker.id)
            .copied()
            .unwrap_or(InstanceState::Terminated))
    }

    async fn shutdown(&self, workers: &[Worker], mode: ShutdownMode) -> Result<(), ProvisionError> {
        let ids: Vec<String> = workers.iter().map(|w| w.id.clone()).collect();
        let next = match mode {
            ShutdownMode::Stop => InstanceState::Stopped,
            ShutdownMode::Terminate => InstanceState::Terminated,
        };
        {
            let mut states = self.states.lock().unwrap();
            for id in &ids {
                states.insert(id.clone(), next);
            }
        }
        self.shutdowns.lock().unwrap().push((ids, mode));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeInitializer {
    pub initialized: Mutex<Vec<String>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Initializer for FakeInitializer {
    async fn initialize(&self, workers: &[Worker]) -> Result<(), ProvisionError> {
        self.calls.lock().unwrap().push("initialize");
        self.initialized
            .lock()
            .unwrap()
            .extend(workers.iter().map(|w| w.id.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAutoShutdown {
    pub scheduled: Mutex<Vec<(Vec<String>, u32)>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl AutoShutdownScheduler for FakeAutoShutdown {
    async fn schedule(&self, workers: &[Worker], minutes: u32) -> Result<(), ProvisionError> {
        self.calls.lock().unwrap().push("schedule_auto_shutdown");
        self.scheduled
            .lock()
            .unwrap()
            .push((workers.iter().map(|w| w.id.clone()).collect(), minutes));
        Ok(())
    }
}

pub struct Fleet {
    pub provisioner: Arc<FakeProvisioner>,
    pub initializer: Arc<FakeInitializer>,
    pub auto_shutdown: Arc<FakeAutoShutdown>,
    /// Initializer and auto-shutdown calls, in the order they happened.
    pub calls: Arc<Mutex<Vec<&'static str>>>,
}

impl Fleet {
    pub fn new(provisioner: FakeProvisioner) -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        Self {
            provisioner: Arc::new(provisioner),
            initializer: Arc::new(FakeInitializer {
                calls: calls.clone(),
                ..Default::default()
            }),
            auto_shutdown: Arc::new(FakeAutoShutdown {
                calls: calls.clone(),
                ..Default::default()
            }),
            calls,
        }
    }

    pub fn services(&self) -> PoolServices {
        PoolServices {
            provisioner: self.provisioner.clone(),
            initializer: self.initializer.clone(),
            auto_shutdown: self.auto_shutdown.clone(),
        }
    }
}

// ============================================================================
// Remote execution
// ============================================================================

struct Rule {
    needle: String,
    outputs: VecDeque<CommandOutput>,
    last: CommandOutput,
}

/// Shared state of every session opened through one [`FakeTransport`].
#[derive(Default)]
pub struct FakeRemote {
    rules: Mutex<Vec<Rule>>,
    /// `(address, command)` in execution order.
    pub commands: Mutex<Vec<(String, String)>>,
    /// `(address, remote path, contents)` of every upload.
    pub puts: Mutex<Vec<(String, String, String)>>,
    pub connects: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    pub refuse: Mutex<HashSet<String>>,
}

impl FakeRemote {
    fn output_for(&self, command: &str) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.needle)) {
            return rule.outputs.pop_front().unwrap_or_else(|| rule.last.clone());
        }
        let stdout = if command.contains("echo $HOME") {
            "/home/ubuntu\n".to_string()
        } else if command.contains("which docker") {
            "/usr/bin/docker\n".to_string()
        } else if command.contains("docker images -q") {
            "0123abcd\n".to_string()
        } else if command.starts_with("cat ") {
            r#"{"fires": [{"id": "fire"}]}"#.to_string()
        } else if command.starts_with("test -") {
            "yes\n".to_string()
        } else {
            String::new()
        };
        CommandOutput::stdout(stdout)
    }

    pub fn commands_on(&self, address: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn all_commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.all_commands().iter().any(|c| c.contains(needle))
    }

    pub fn put_contents(&self, suffix: &str) -> Vec<String> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, path, _)| path.ends_with(suffix))
            .map(|(_, _, contents)| contents.clone())
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    pub remote: Arc<FakeRemote>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `needle` with `stdout`.
    pub fn respond(&self, needle: &str, stdout: &str) -> &Self {
        self.respond_seq(needle, &[stdout])
    }

    /// Answer successive commands containing `needle` with each of
    /// `stdouts`, repeating the last one.
    pub fn respond_seq(&self, needle: &str, stdouts: &[&str]) -> &Self {
        let outputs: VecDeque<CommandOutput> =
            stdouts.iter().map(|s| CommandOutput::stdout(*s)).collect();
        let last = outputs
            .back()
            .cloned()
            .unwrap_or_else(|| CommandOutput::stdout(""));
        self.remote.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            outputs,
            last,
        });
        self
    }

    /// Make commands containing `needle` write `stderr`.
    pub fn fail(&self, needle: &str, stderr: &str) -> &Self {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
        };
        self.remote.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            outputs: VecDeque::new(),
            last: output,
        });
        self
    }

    pub fn refuse(&self, address: &str) -> &Self {
        self.remote
            .refuse
            .lock()
            .unwrap()
            .insert(address.to_string());
        self
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.remote
            .connects
            .lock()
            .unwrap()
            .push(address.to_string());
        if self.remote.refuse.lock().unwrap().contains(address) {
            return Err(RemoteError::ConnectFailed {
                address: address.to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            address: address.to_string(),
            remote: self.remote.clone(),
        }))
    }
}

struct FakeSession {
    address: String,
    remote: Arc<FakeRemote>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.remote
            .commands
            .lock()
            .unwrap()
            .push((self.address.clone(), command.to_string()));
        Ok(self.remote.output_for(command))
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let contents = std::fs::read_to_string(local)?;
        self.remote
            .puts
            .lock()
            .unwrap()
            .push((self.address.clone(), remote.to_string(), contents));
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        std::fs::write(local, format!("contents of {remote}"))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.remote.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Storage, status and notification
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn json(&self, key: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn url(&self, key: &str) -> String {
        format!("mem://{key}")
    }

    async fn upload_file(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(local).await?;
        self.upload_bytes(&bytes, key).await
    }

    async fn upload_bytes(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(self.url(key))
    }

    async fn exists(&self, url: &str) -> Result<bool, StorageError> {
        let key = url
            .strip_prefix("mem://")
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

#[derive(Default)]
pub struct MemoryStatusSink {
    pub writes: Mutex<Vec<StatusDocument>>,
}

impl MemoryStatusSink {
    pub fn last(&self) -> StatusDocument {
        self.writes.lock().unwrap().last().cloned().unwrap()
    }

    /// Statuses `run_id` went through, with repeats collapsed.
    pub fn history(&self, run_id: &str) -> Vec<RunStatus> {
        let mut history: Vec<RunStatus> = Vec::new();
        for doc in self.writes.lock().unwrap().iter() {
            if let Some(record) = doc.runs.get(run_id) {
                if history.last() != Some(&record.status) {
                    history.push(record.status);
                }
            }
        }
        history
    }

    /// Number of writes that moved `run_id` into a terminal status.
    pub fn terminal_writes(&self, run_id: &str) -> usize {
        let writes = self.writes.lock().unwrap();
        let mut previous = None;
        let mut count = 0;
        for doc in writes.iter() {
            let current = doc.runs.get(run_id).map(|r| r.status);
            if current != previous && current.is_some_and(|s| s.is_terminal()) {
                count += 1;
            }
            previous = current;
        }
        count
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn persist(&self, _request_id: &str, document: &StatusDocument) -> Result<(), StorageError> {
        self.writes.lock().unwrap().push(document.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notified: Mutex<Vec<(String, StatusDocument)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request_id: &str, status: &StatusDocument) {
        self.notified
            .lock()
            .unwrap()
            .push((request_id.to_string(), status.clone()));
    }
}
