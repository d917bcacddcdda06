//! One job on one worker, end to end against in-memory collaborators.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{config_with, fast_pool_config, FakeProvisioner, FakeTransport, Fleet, MemoryStatusSink, MemoryStore};
use firefleet::config::Config;
use firefleet::fleet::{InstancePool, Worker};
use firefleet::runner::{merge_config, Job, JobReport, JobRunner, RunContext};
use firefleet::shutdown::ShutdownToken;
use firefleet::status::{RunStatus, StatusTracker};

struct Harness {
    fleet: Fleet,
    transport: FakeTransport,
    store: Arc<MemoryStore>,
    sink: Arc<MemoryStatusSink>,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config_with(|_| {}))
    }

    fn with_config(config: Config) -> Self {
        Self {
            fleet: Fleet::new(FakeProvisioner::new()),
            transport: FakeTransport::new(),
            store: Arc::new(MemoryStore::default()),
            sink: Arc::new(MemoryStatusSink::default()),
            config,
        }
    }

    fn context(&self, bluesky_config: Value) -> RunContext {
        RunContext {
            request_id: "req".to_string(),
            config: Arc::new(self.config.clone()),
            bluesky_config,
            transport: Arc::new(self.transport.clone()),
            store: self.store.clone(),
        }
    }

    /// Run `fire` on one freshly launched worker and close the pool.
    async fn run_on_new_worker(&self, fire: Value, token: &ShutdownToken) -> JobReport {
        let pool = InstancePool::new(self.fleet.services(), fast_pool_config(), 1, vec![]);
        pool.open(token).await.unwrap();
        let worker = pool.instances().await.remove(0);

        let ctx = self.context(merge_config(&json!({}), &json!({}), &json!({})));
        let tracker = StatusTracker::new("req", self.sink.clone());
        let report = JobRunner::new(&ctx, &tracker, &pool, token)
            .run(Job::from_fire(fire), worker)
            .await;
        pool.close().await.unwrap();
        report
    }
}

#[tokio::test]
async fn test_successful_run_publishes_everything() {
    let h = Harness::new();
    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.run_id, "f1");
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.log_url.as_deref(), Some("mem://log/req/f1.log"));
    assert_eq!(
        report.output_url.as_deref(),
        Some("mem://output/req/f1.tar.gz")
    );

    let keys = h.store.keys();
    assert!(keys.contains(&"input/req/f1-input.json".to_string()));
    assert_eq!(
        h.store.json("input/req/f1-input.json"),
        Some(json!({"fires": [{"id": "f1"}]}))
    );

    assert_eq!(h.sink.history("f1"), vec![RunStatus::Running, RunStatus::Success]);
    let record = &h.sink.last().runs["f1"];
    assert_eq!(record.output_url, report.output_url);
    assert_eq!(record.log_url, report.log_url);

    let remote = &h.transport.remote;
    let commands = remote.commands_on(&report.worker.address);
    let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
    assert!(position("mkdir -p") < position("nohup sh -c"));
    assert!(position("nohup sh -c") < position("tar czf"));
    assert!(commands.iter().any(|c| c.contains("--run-id=f1")));
    // Leftover output is removed first and cleaned up at the end.
    assert!(commands.first().unwrap().contains("echo $HOME"));
    assert!(commands.last().unwrap().starts_with("rm -rf"));
    assert!(!remote.ran("get.docker.com"));
    assert!(!remote.ran("docker pull"));

    assert_eq!(remote.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.fleet.provisioner.terminated_ids(), vec![report.worker.id.clone()]);
}

#[tokio::test]
async fn test_writes_merged_config_and_single_fire_input() {
    let h = Harness::new();
    let pool = InstancePool::new(
        h.fleet.services(),
        fast_pool_config(),
        1,
        vec![Worker::existing("10.0.0.1")],
    );
    let token = ShutdownToken::new();
    pool.open(&token).await.unwrap();

    let merged = merge_config(&json!({"a": 1, "b": 1}), &json!({"b": 2}), &json!({"b": 3, "c": 1}));
    let ctx = h.context(merged);
    let tracker = StatusTracker::new("req", h.sink.clone());
    JobRunner::new(&ctx, &tracker, &pool, &token)
        .run(Job::from_fire(json!({"id": "f2", "type": "wildfire"})), Worker::existing("10.0.0.1"))
        .await;

    let configs = h.transport.remote.put_contents("/f2/config.json");
    assert_eq!(configs.len(), 1);
    let written: Value = serde_json::from_str(&configs[0]).unwrap();
    assert_eq!(written["config"]["a"], 1);
    assert_eq!(written["config"]["b"], 3);
    assert_eq!(written["config"]["c"], 1);
    assert_eq!(written["config"]["export"]["modes"], json!(["localsave"]));

    let inputs = h.transport.remote.put_contents("/f2/input.json");
    let input: Value = serde_json::from_str(&inputs[0]).unwrap();
    assert_eq!(input, json!({"fires": [{"id": "f2", "type": "wildfire"}]}));

    // Existing workers are never terminated.
    assert_eq!(h.fleet.provisioner.shutdown_calls(), 0);
}

#[tokio::test]
async fn test_missing_docker_is_installed() {
    let h = Harness::new();
    h.transport
        .respond_seq("which docker", &["", "/usr/bin/docker\n"]);

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Success);
    assert!(h.transport.remote.ran("get.docker.com"));
}

#[tokio::test]
async fn test_docker_check_error_does_not_install() {
    let h = Harness::new();
    h.transport.fail("which docker", "sudo: unable to resolve host");

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Unknown);
    assert!(report.message.unwrap().contains("which docker"));
    assert!(!h.transport.remote.ran("get.docker.com"));
    assert_eq!(h.fleet.provisioner.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_missing_image_is_pulled() {
    let h = Harness::new();
    h.transport
        .respond_seq("docker images -q", &["", "0123abcd\n"]);

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Success);
    assert!(h
        .transport
        .remote
        .ran("docker pull -q 'pnwairfire/bluesky:v4.2.9'"));
}

#[tokio::test]
async fn test_error_in_output_is_a_failure() {
    let h = Harness::new();
    h.transport.respond(
        "cat ",
        r#"{"fires": [{"id": "f1", "error": "no fuelbeds"}]}"#,
    );

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(report.message.as_deref(), Some("no fuelbeds"));
    assert!(report.log_url.is_some());
    assert_eq!(h.sink.terminal_writes("f1"), 1);
}

#[tokio::test]
async fn test_remote_error_is_unknown_and_keeps_captured_urls() {
    let h = Harness::new();
    h.transport.fail("tar czf", "tar: exports: Cannot open");

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Unknown);
    assert!(report.message.as_deref().unwrap().contains("Cannot open"));
    assert_eq!(report.log_url.as_deref(), Some("mem://log/req/f1.log"));
    assert_eq!(report.output_url, None);

    let record = &h.sink.last().runs["f1"];
    assert_eq!(record.status, RunStatus::Unknown);
    assert_eq!(record.log_url.as_deref(), Some("mem://log/req/f1.log"));
    assert_eq!(h.sink.terminal_writes("f1"), 1);
    assert_eq!(h.transport.remote.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.fleet.provisioner.terminated_ids(), vec![report.worker.id.clone()]);
}

#[tokio::test]
async fn test_connect_failure_is_unknown() {
    let h = Harness::new();
    h.transport.refuse("10.1.0.1");

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.worker.address, "10.1.0.1");
    assert_eq!(report.status, RunStatus::Unknown);
    assert!(report.message.unwrap().contains("Connection refused"));
    assert_eq!(h.sink.history("f1"), vec![RunStatus::Running, RunStatus::Unknown]);
    assert_eq!(h.fleet.provisioner.terminated_ids(), vec![report.worker.id.clone()]);
}

#[tokio::test]
async fn test_interrupt_stops_container_and_ends_unknown() {
    let h = Harness::new();
    h.transport.respond("ps -eo", "docker run --rm --name bluesky-f1 ...");
    let token = ShutdownToken::new();

    let canceller = tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
            token.cancel("SIGINT");
        }
    });
    let report = h.run_on_new_worker(json!({"id": "f1"}), &token).await;
    canceller.await.unwrap();

    assert_eq!(report.status, RunStatus::Unknown);
    assert!(h.transport.remote.ran("docker rm -f bluesky-f1"));
    assert_eq!(h.fleet.provisioner.terminated_ids(), vec![report.worker.id.clone()]);
}

#[tokio::test]
async fn test_run_id_format_is_applied() {
    let h = Harness::with_config(config_with(|v| {
        v["run_id_format"] = json!("{request_id}-{fire_id}");
    }));

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    assert_eq!(report.run_id, "req-f1");
    assert!(h.store.keys().contains(&"input/req/req-f1-input.json".to_string()));
}

#[tokio::test]
async fn test_output_left_in_place_without_cleanup() {
    let h = Harness::with_config(config_with(|v| {
        v["cleanup_output"] = json!(false);
    }));

    let report = h
        .run_on_new_worker(json!({"id": "f1"}), &ShutdownToken::new())
        .await;

    let commands = h.transport.remote.commands_on(&report.worker.address);
    assert_eq!(commands.iter().filter(|c| c.starts_with("rm -rf")).count(), 1);
}
