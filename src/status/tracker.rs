//! Serialized, persist-on-every-change status bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RunRecord, RunStatus, StatusDocument, SystemError, SystemState};
use crate::error::StorageError;
use crate::storage::{keys, upload_json, ObjectStore};

/// Durable destination of the status document.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Replace the stored document for `request_id`.
    async fn persist(&self, request_id: &str, document: &StatusDocument)
        -> Result<(), StorageError>;
}

/// Writes the status document to `status/<request_id>-status.json`.
pub struct ObjectStoreStatusSink {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStatusSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatusSink for ObjectStoreStatusSink {
    async fn persist(
        &self,
        request_id: &str,
        document: &StatusDocument,
    ) -> Result<(), StorageError> {
        upload_json(self.store.as_ref(), document, &keys::status(request_id)).await?;
        Ok(())
    }
}

/// Fields to merge into a run's record; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub message: Option<String>,
    pub output_url: Option<String>,
    pub log_url: Option<String>,
}

impl RunUpdate {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_output_url(mut self, url: Option<String>) -> Self {
        self.output_url = url;
        self
    }

    pub fn with_log_url(mut self, url: Option<String>) -> Self {
        self.log_url = url;
        self
    }
}

/// Holds the status document of one request.
///
/// Every mutation reads, modifies and persists the whole document while
/// holding one lock, so concurrent job runners never lose each other's
/// updates, and a change is durable before the mutating call returns.
pub struct StatusTracker {
    request_id: String,
    sink: Arc<dyn StatusSink>,
    document: Mutex<StatusDocument>,
}

impl StatusTracker {
    pub fn new(request_id: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            request_id: request_id.into(),
            sink,
            document: Mutex::new(StatusDocument::default()),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn set_system_state(
        &self,
        state: SystemState,
        error: Option<SystemError>,
        message: Option<String>,
    ) -> Result<(), StorageError> {
        let mut document = self.document.lock().await;
        document.system_state = state;
        document.system_error = error;
        document.system_message = message;
        info!(request_id = %self.request_id, state = ?state, error = ?error, "System status");
        self.sink.persist(&self.request_id, &document).await
    }

    pub async fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        update: RunUpdate,
    ) -> Result<(), StorageError> {
        let mut document = self.document.lock().await;
        let previous = document.runs.get(run_id).map(|r| r.status);
        document.counts.transition(previous, status);

        let record = document
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunRecord {
                status,
                message: None,
                output_url: None,
                log_url: None,
            });
        record.status = status;
        if update.message.is_some() {
            record.message = update.message;
        }
        if update.output_url.is_some() {
            record.output_url = update.output_url;
        }
        if update.log_url.is_some() {
            record.log_url = update.log_url;
        }

        debug!(request_id = %self.request_id, run_id = %run_id, status = %status, "Run status");
        self.sink.persist(&self.request_id, &document).await
    }

    /// Mark the request complete, summarizing job outcomes in `system_error`.
    pub async fn finalize(&self) -> Result<StatusDocument, StorageError> {
        let mut document = self.document.lock().await;
        document.system_state = SystemState::Complete;
        document.system_error = SystemError::summarize(&document.counts);
        document.system_message = None;
        info!(
            request_id = %self.request_id,
            error = ?document.system_error,
            success = document.counts.success,
            failure = document.counts.failure,
            unknown = document.counts.unknown,
            "Request complete"
        );
        self.sink.persist(&self.request_id, &document).await?;
        Ok(document.clone())
    }

    pub async fn snapshot(&self) -> StatusDocument {
        self.document.lock().await.clone()
    }
}
