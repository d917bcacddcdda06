//! Loading the batch of fires for a request.
//!
//! Input is a local JSON file or an `http(s)` URL. Input that does not
//! exist yet (missing file, HTTP 404) is waited for according to the
//! configured [`RetryPolicy`]; while waiting the request is reported as
//! `waiting`, and once the policy gives up it is completed with
//! `no_fire_data`.

pub mod retry;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownToken;
use crate::status::{StatusTracker, SystemError, SystemState};

pub use retry::{decide, ErrorKind, RetryDecision, RetryPolicy};

/// Message recorded when input never became available.
const NOT_AVAILABLE: &str = "Fire data does not exist";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Fire data does not exist: {0}")]
    NotYetAvailable(String),

    #[error("Failed to download '{url}': {reason}")]
    Download { url: String, reason: String },

    #[error("Invalid input document: {0}")]
    InvalidDocument(String),

    #[error("Interrupted while waiting for input")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InputError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotYetAvailable(_) => ErrorKind::NotYetAvailable,
            _ => ErrorKind::Terminal,
        }
    }
}

/// A loaded batch of fires.
#[derive(Debug)]
pub struct InputBatch {
    /// Input file name without directories, e.g. `fires.json`.
    pub file_name: String,
    /// Where the input can be read locally.
    pub local_path: PathBuf,
    /// The whole input document.
    pub document: Value,
    /// One entry per job.
    pub fires: Vec<Value>,
    /// Simulation settings supplied with the input (`run_config` or `bluesky_config`).
    pub run_config: Value,
    _download_dir: Option<TempDir>,
}

/// Downloads and parses input, waiting for it if necessary.
#[derive(Debug, Clone)]
pub struct InputLoader {
    client: Client,
    policy: RetryPolicy,
}

impl InputLoader {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
            policy,
        }
    }

    /// Load `source`, recording waits and failures on `tracker`.
    pub async fn load(
        &self,
        source: &str,
        tracker: &StatusTracker,
        shutdown: &ShutdownToken,
    ) -> Result<InputBatch, InputError> {
        let file_name = file_name(source);

        let (local_path, download_dir) = if is_url(source) {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join(&file_name);
            self.with_retry(tracker, shutdown, || self.download(source, &path))
                .await?;
            (path, Some(dir))
        } else {
            (PathBuf::from(source), None)
        };

        let document = self
            .with_retry(tracker, shutdown, || read_document(&local_path))
            .await?;
        let (fires, run_config) = match split_document(&document) {
            Ok(parts) => parts,
            Err(e) => return Err(self.give_up(tracker, e).await),
        };

        info!(source = %source, fires = fires.len(), "Loaded input");
        Ok(InputBatch {
            file_name,
            local_path,
            document,
            fires,
            run_config,
            _download_dir: download_dir,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), InputError> {
        info!(url = %url, "Downloading input");
        let failed = |reason: String| InputError::Download {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(InputError::NotYetAvailable(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(
        &self,
        tracker: &StatusTracker,
        shutdown: &ShutdownToken,
        mut attempt_fn: F,
    ) -> Result<T, InputError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InputError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match decide(attempt, err.kind(), &self.policy) {
                RetryDecision::Retry(delay) => {
                    if let Err(e) = tracker
                        .set_system_state(
                            SystemState::Waiting,
                            Some(SystemError::WaitingForFires),
                            None,
                        )
                        .await
                    {
                        warn!(error = %e, "Failed to record waiting status");
                    }
                    warn!(
                        attempt,
                        seconds = delay.as_secs(),
                        error = %err,
                        "Waiting before retrying input load"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(InputError::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::Abort => return Err(self.give_up(tracker, err).await),
            }
        }
    }

    /// Record that input could not be loaded and hand the error back.
    async fn give_up(&self, tracker: &StatusTracker, err: InputError) -> InputError {
        let message = match &err {
            InputError::NotYetAvailable(_) => NOT_AVAILABLE.to_string(),
            other => other.to_string(),
        };
        error!(error = %err, "Failed to load input");
        if let Err(e) = tracker
            .set_system_state(
                SystemState::Complete,
                Some(SystemError::NoFireData),
                Some(message),
            )
            .await
        {
            warn!(error = %e, "Failed to record input failure");
        }
        err
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Last path segment of a path or URL, ignoring any query string.
pub fn file_name(source: &str) -> String {
    let path = if is_url(source) {
        source.split(['?', '#']).next().unwrap_or(source)
    } else {
        source
    };
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

async fn read_document(path: &Path) -> Result<Value, InputError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(InputError::NotYetAvailable(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&text).map_err(|e| InputError::InvalidDocument(e.to_string()))
}

fn split_document(document: &Value) -> Result<(Vec<Value>, Value), InputError> {
    let fires = document
        .get("fires")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| InputError::InvalidDocument("missing 'fires' array".to_string()))?;
    let run_config = ["run_config", "bluesky_config"]
        .iter()
        .filter_map(|key| document.get(*key))
        .find(|v| v.as_object().is_some_and(|m| !m.is_empty()))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok((fires, run_config))
}
