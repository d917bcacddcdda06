//! Whole requests through the parallel orchestrator.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use common::{
    config_with, fast_pool_config, FakeProvisioner, FakeTransport, Fleet, MemoryStatusSink,
    MemoryStore, RecordingNotifier,
};
use firefleet::config::{Config, WaitStrategy};
use firefleet::input::{InputLoader, RetryPolicy};
use firefleet::orchestrator::{
    Collaborators, OrchestratorError, ParallelOrchestrator, RunOptions, UNPAIRED_MESSAGE,
};
use firefleet::shutdown::ShutdownToken;
use firefleet::status::{RunStatus, SystemError, SystemState};

struct Harness {
    fleet: Fleet,
    transport: FakeTransport,
    store: Arc<MemoryStore>,
    sink: Arc<MemoryStatusSink>,
    notifier: Arc<RecordingNotifier>,
    dir: TempDir,
}

impl Harness {
    fn new(provisioner: FakeProvisioner) -> Self {
        Self {
            fleet: Fleet::new(provisioner),
            transport: FakeTransport::new(),
            store: Arc::new(MemoryStore::default()),
            sink: Arc::new(MemoryStatusSink::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn orchestrator(&self, config: Config) -> ParallelOrchestrator {
        ParallelOrchestrator::new(
            config,
            Collaborators {
                pool: self.fleet.services(),
                transport: Arc::new(self.transport.clone()),
                store: self.store.clone(),
                status_sink: self.sink.clone(),
                notifier: self.notifier.clone(),
            },
        )
        .with_pool_config(fast_pool_config())
    }

    fn write_input(&self, document: Value) -> PathBuf {
        let path = self.dir.path().join("fires.json");
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();
        path
    }
}

fn fires(ids: &[&str]) -> Value {
    json!({"fires": ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>()})
}

fn max_instances(n: usize) -> Config {
    config_with(|v| v["aws"]["ec2"]["max_num_instances"] = json!(n))
}

#[tokio::test]
async fn test_three_jobs_two_instances() {
    let h = Harness::new(FakeProvisioner::new());
    let input = h.write_input(fires(&["a", "b", "c"]));

    let summary = h
        .orchestrator(max_instances(2))
        .run(input.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
        .await
        .unwrap();

    assert_eq!(summary.request_id, "fires");
    assert_eq!(h.fleet.provisioner.launched_names().len(), 2);
    assert_eq!(summary.reports.len(), 2);
    assert!(summary.reports.iter().all(|r| r.status == RunStatus::Success));
    assert_eq!(summary.unpaired, vec!["c".to_string()]);

    // Both new workers are terminated once each, by their runners.
    let mut terminated = h.fleet.provisioner.terminated_ids();
    terminated.sort();
    let mut workers: Vec<String> = summary.reports.iter().map(|r| r.worker.id.clone()).collect();
    workers.sort();
    assert_eq!(terminated, workers);

    let status = &summary.status;
    assert_eq!(status.system_state, SystemState::Complete);
    assert_eq!(status.system_error, Some(SystemError::SomeRunsUnknown));
    assert_eq!(status.counts.success, 2);
    assert_eq!(status.counts.unknown, 1);
    assert_eq!(status.runs["c"].message.as_deref(), Some(UNPAIRED_MESSAGE));

    for doc in h.sink.writes.lock().unwrap().iter() {
        assert_eq!(doc.counts.total(), doc.runs.len());
    }
    assert_eq!(h.notifier.notified.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_request_artifacts_are_published() {
    let h = Harness::new(FakeProvisioner::new());
    let input = h.write_input(json!({
        "fires": [{"id": "a"}],
        "run_config": {"dispersion": {"num_hours": 24}}
    }));

    h.orchestrator(config_with(|v| {
        v["bluesky"]["config"] = json!({"emissions": {"model": "feps"}});
    }))
    .run(input.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
    .await
    .unwrap();

    let keys = h.store.keys();
    assert!(keys.contains(&"requests/fires.json".to_string()));
    assert!(keys.iter().any(|k| k.starts_with("request-index/") && k.ends_with("/fires")));

    let published = h.store.json("config/fires-config-bluesky.json").unwrap();
    assert_eq!(published["config"]["emissions"]["model"], "feps");
    assert_eq!(published["config"]["dispersion"]["num_hours"], 24);
    assert!(published["config"]["export"].is_object());

    let own = h.store.json("config/fires-config-bluesky-aws.json").unwrap();
    assert_eq!(own["ssh_key"], "***");
    assert_eq!(own["aws"]["iam_instance_profile"]["Name"], "***");
}

#[tokio::test]
async fn test_existing_workers_are_used_first() {
    let h = Harness::new(FakeProvisioner::new());
    let input = h.write_input(fires(&["a", "b"]));

    let summary = h
        .orchestrator(config_with(|_| {}))
        .run(
            input.to_str().unwrap(),
            RunOptions {
                existing: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                request_id: Some("custom".to_string()),
            },
            &ShutdownToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.request_id, "custom");
    assert!(h.fleet.provisioner.launches.lock().unwrap().is_empty());
    assert_eq!(h.fleet.provisioner.shutdown_calls(), 0);
    let mut addresses: Vec<String> = summary.reports.iter().map(|r| r.worker.address.clone()).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(summary.status.system_error, None);
}

#[tokio::test]
async fn test_unpaired_jobs_policy_error_fails_before_launch() {
    let h = Harness::new(FakeProvisioner::new());
    let input = h.write_input(fires(&["a", "b", "c"]));
    let config = config_with(|v| {
        v["aws"]["ec2"]["max_num_instances"] = json!(1);
        v["unpaired_jobs"] = json!("error");
    });

    let err = h
        .orchestrator(config)
        .run(input.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnpairedJobs { jobs: 3, workers: 1 }));
    assert!(h.fleet.provisioner.launches.lock().unwrap().is_empty());
    let last = h.sink.last();
    assert_eq!(last.system_state, SystemState::Complete);
    assert_eq!(last.system_error, Some(SystemError::Aborted));
}

#[tokio::test]
async fn test_provisioning_failure_tears_down_and_fails() {
    let h = Harness::new(FakeProvisioner::failing_after(1));
    let input = h.write_input(fires(&["a", "b"]));

    let err = h
        .orchestrator(config_with(|_| {}))
        .run(input.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Pool(_)));
    assert_eq!(h.fleet.provisioner.terminated_ids().len(), 1);
    assert!(h.transport.remote.connects.lock().unwrap().is_empty());
    let last = h.sink.last();
    assert_eq!(last.system_error, Some(SystemError::ProvisioningFailed));
    assert!(last.runs.is_empty());
}

#[tokio::test]
async fn test_missing_input_fails_with_no_fire_data() {
    let h = Harness::new(FakeProvisioner::new());
    let missing = h.dir.path().join("fires.json");

    let err = h
        .orchestrator(config_with(|_| {}))
        .run(missing.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Input(_)));
    let last = h.sink.last();
    assert_eq!(last.system_state, SystemState::Complete);
    assert_eq!(last.system_error, Some(SystemError::NoFireData));
    assert!(h.fleet.provisioner.launches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupt_mid_provisioning_aborts_after_teardown() {
    let (provisioner, gate) = FakeProvisioner::gated();
    let h = Harness::new(provisioner);
    let input = h.write_input(fires(&["a", "b"]));
    let token = ShutdownToken::new();

    let provisioner = h.fleet.provisioner.clone();
    let interrupter = tokio::spawn({
        let token = token.clone();
        async move {
            provisioner.launch_started.notified().await;
            token.cancel("SIGTERM");
            tokio::time::sleep(Duration::from_millis(30)).await;
            gate.notify_one();
        }
    });

    let err = h
        .orchestrator(config_with(|_| {}))
        .run(input.to_str().unwrap(), RunOptions::default(), &token)
        .await
        .unwrap_err();
    interrupter.await.unwrap();

    assert!(matches!(err, OrchestratorError::Interrupted(ref r) if r == "SIGTERM"));
    assert_eq!(h.fleet.provisioner.terminated_ids().len(), 2);
    assert!(h.transport.remote.connects.lock().unwrap().is_empty());
    let last = h.sink.last();
    assert_eq!(last.system_state, SystemState::Complete);
    assert_eq!(last.system_error, Some(SystemError::Aborted));
}

#[tokio::test]
async fn test_job_failures_do_not_fail_the_request() {
    let h = Harness::new(FakeProvisioner::new());
    h.transport.refuse("10.1.0.1");
    let input = h.write_input(fires(&["a"]));

    let summary = h
        .orchestrator(config_with(|_| {}))
        .run(input.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
        .await
        .unwrap();

    assert_eq!(summary.reports[0].status, RunStatus::Unknown);
    assert_eq!(summary.status.system_error, Some(SystemError::SomeRunsUnknown));
    assert_eq!(h.fleet.provisioner.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_late_input_returns_request_to_running() {
    let h = Harness::new(FakeProvisioner::new());
    let path = h.dir.path().join("fires.json");
    let writer = tokio::spawn({
        let path = path.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::write(&path, serde_json::to_string(&fires(&["a"])).unwrap()).unwrap();
        }
    });

    let loader = InputLoader::new(RetryPolicy {
        strategy: WaitStrategy::Fixed,
        wait: Duration::from_millis(200),
        max_attempts: 10,
    });
    let summary = h
        .orchestrator(config_with(|_| {}))
        .with_loader(loader)
        .run(path.to_str().unwrap(), RunOptions::default(), &ShutdownToken::new())
        .await
        .unwrap();
    writer.await.unwrap();

    let writes = h.sink.writes.lock().unwrap();
    assert!(writes.iter().any(|d| d.system_state == SystemState::Waiting));
    let running = writes
        .iter()
        .find(|d| d.runs.get("a").map(|r| r.status) == Some(RunStatus::Running))
        .unwrap();
    assert_eq!(running.system_state, SystemState::Running);
    assert_eq!(running.system_error, None);
    assert_eq!(summary.status.system_error, None);
}
