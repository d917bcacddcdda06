//! End-of-request notification.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::EmailSettings;
use crate::status::StatusDocument;

/// Told once per request, after the status document is final.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request_id: &str, status: &StatusDocument);
}

/// Logs a summary of the finished request.
///
/// Email settings are accepted so configurations stay portable, but no mail
/// is sent; an enabled email block is reported as skipped.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    email: EmailSettings,
}

impl LogNotifier {
    pub fn new(email: EmailSettings) -> Self {
        Self { email }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, request_id: &str, status: &StatusDocument) {
        info!(
            request_id = %request_id,
            state = ?status.system_state,
            error = ?status.system_error,
            success = status.counts.success,
            failure = status.counts.failure,
            unknown = status.counts.unknown,
            "Request summary"
        );
        if self.email.enabled {
            warn!(
                request_id = %request_id,
                recipients = %self.email.recipients.join(", "),
                "Email notification is not supported; skipped"
            );
        }
    }
}
