//! Run-wide cancellation.
//!
//! A single [`ShutdownToken`] is created per run and handed to the instance
//! pool, the input loader and every job runner. Interrupt signals are caught
//! once for the whole run by [`spawn_signal_listener`], which cancels the
//! token; the components observe it at their suspension points and unwind
//! through their normal cleanup paths.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Token for signaling cancellation to every component of a run.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug, Default)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    reason: std::sync::Mutex<Option<String>>,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Why the token was cancelled, if it was.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Spawns a task that cancels `token` on the first SIGINT or SIGTERM.
///
/// Later signals are logged and otherwise ignored so teardown can finish.
/// Tokio keeps its handlers installed for the life of the process, so
/// aborting the returned handle stops the logging but does not restore the
/// default signal behavior.
pub fn spawn_signal_listener(token: ShutdownToken) -> JoinHandle<()> {
    tokio::spawn(forward_signals(token, wait_for_signal))
}

async fn forward_signals<F, Fut>(token: ShutdownToken, mut next: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<&'static str>>,
{
    loop {
        match next().await {
            Ok(signame) if token.is_cancelled() => {
                warn!(signal = signame, "Received signal; teardown already in progress");
            }
            Ok(signame) => {
                warn!(
                    signal = signame,
                    "Received signal; terminating new instances and then aborting"
                );
                token.cancel(signame);
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "SIGINT")
}
