//! Active-runner registry: at most one live agent process per conversation.
//!
//! Each registered process gets a watchdog task that fires after a
//! configurable window without activity refreshes. On fire the watchdog
//! invokes the registered timeout callback, kills the process, and removes
//! the entry. Registering over an existing entry kills the old process
//! first, so a superseded process is dead before any of its successor's
//! events are observed.
//!
//! Activity refreshes and unregistration carry the caller's process handle
//! and are identity-guarded: a stale handle from a superseded process can
//! neither keep the current watchdog alive nor tear down the current entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::runner::process::AgentProcess;
use crate::Result;

/// Callback invoked when a watchdog fires, before the process is killed.
/// Errors are logged by the watchdog and never propagate.
pub type TimeoutHandler =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// One live process registration.
struct RunnerEntry {
    handle: AgentProcess,
    registered_at: Instant,
    last_activity: Instant,
    reset: Arc<Notify>,
    cancel: CancellationToken,
}

type EntryMap = Arc<Mutex<HashMap<String, RunnerEntry>>>;

/// Registry of live agent processes keyed by conversation.
///
/// Shared via `Arc`; all methods take `&self`.
pub struct ActiveRunners {
    entries: EntryMap,
    inactivity_window: Duration,
}

impl ActiveRunners {
    /// Create a registry whose watchdogs fire after `inactivity_window`
    /// without an activity refresh.
    #[must_use]
    pub fn new(inactivity_window: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            inactivity_window,
        }
    }

    /// Register `handle` as the conversation's live process and start its
    /// watchdog.
    ///
    /// An existing registration is superseded: its watchdog is cancelled
    /// and its process killed before the new entry becomes visible.
    pub async fn register(
        &self,
        conversation_id: &str,
        handle: AgentProcess,
        on_timeout: Option<TimeoutHandler>,
    ) {
        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(conversation_id) {
            warn!(
                conversation_id,
                age_seconds = old.registered_at.elapsed().as_secs(),
                "superseding active agent process"
            );
            old.cancel.cancel();
            old.handle.kill().await;
        }

        let reset = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let now = Instant::now();
        entries.insert(
            conversation_id.to_owned(),
            RunnerEntry {
                handle: handle.clone(),
                registered_at: now,
                last_activity: now,
                reset: Arc::clone(&reset),
                cancel: cancel.clone(),
            },
        );
        drop(entries);

        debug!(conversation_id, "registered agent process");
        tokio::spawn(
            watchdog(
                Arc::clone(&self.entries),
                conversation_id.to_owned(),
                handle,
                reset,
                cancel,
                on_timeout,
                self.inactivity_window,
            )
            .instrument(info_span!("watchdog", conversation_id)),
        );
    }

    /// Record activity for the conversation's process.
    ///
    /// Only refreshes when `handle` is the registered instance; activity
    /// from a superseded process must not keep its successor's watchdog
    /// from firing.
    pub async fn refresh_activity(&self, conversation_id: &str, handle: &AgentProcess) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(conversation_id) {
            Some(entry) if entry.handle.same_instance(handle) => {
                entry.last_activity = Instant::now();
                entry.reset.notify_one();
            }
            Some(_) => {
                debug!(
                    conversation_id,
                    "ignoring activity from a superseded process"
                );
            }
            None => {}
        }
    }

    /// Remove the conversation's registration without killing the process.
    /// Identity-guarded like [`ActiveRunners::refresh_activity`]; a no-op
    /// when `handle` is not the registered instance.
    pub async fn unregister(&self, conversation_id: &str, handle: &AgentProcess) {
        let mut entries = self.entries.lock().await;
        let is_current = entries
            .get(conversation_id)
            .is_some_and(|entry| entry.handle.same_instance(handle));
        if is_current {
            if let Some(entry) = entries.remove(conversation_id) {
                entry.cancel.cancel();
            }
            debug!(conversation_id, "unregistered agent process");
        }
    }

    /// Whether the conversation currently has a live registration.
    pub async fn is_active(&self, conversation_id: &str) -> bool {
        self.entries.lock().await.contains_key(conversation_id)
    }

    /// Kill and remove the conversation's process. Returns whether one was
    /// running.
    pub async fn kill_active(&self, conversation_id: &str) -> bool {
        let removed = self.entries.lock().await.remove(conversation_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                entry.handle.kill().await;
                info!(conversation_id, "killed active agent process");
                true
            }
            None => false,
        }
    }

    /// Kill every registered process. Returns how many were killed.
    /// Shutdown path.
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<(String, RunnerEntry)> =
            self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (conversation_id, entry) in drained {
            entry.cancel.cancel();
            entry.handle.kill().await;
            info!(conversation_id, "killed agent process during shutdown");
        }
        count
    }
}

/// Per-entry inactivity timer.
///
/// Re-arms on every activity notification; exits on cancellation. When the
/// window elapses: log, run the timeout callback, kill the process, remove
/// the entry (identity-guarded, in case a new registration raced in).
async fn watchdog(
    entries: EntryMap,
    conversation_id: String,
    handle: AgentProcess,
    reset: Arc<Notify>,
    cancel: CancellationToken,
    on_timeout: Option<TimeoutHandler>,
    window: Duration,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(conversation_id, "watchdog cancelled");
                return;
            }
            () = reset.notified() => {}
            () = tokio::time::sleep(window) => break,
        }
    }

    let idle_seconds = {
        let guard = entries.lock().await;
        guard
            .get(&conversation_id)
            .map_or(window.as_secs(), |entry| {
                entry.last_activity.elapsed().as_secs()
            })
    };
    warn!(
        conversation_id,
        idle_seconds, "agent process idle past inactivity window; killing"
    );

    if let Some(callback) = on_timeout {
        if let Err(err) = callback().await {
            warn!(conversation_id, %err, "inactivity timeout callback failed");
        }
    }
    handle.kill().await;

    let mut guard = entries.lock().await;
    let is_current = guard
        .get(&conversation_id)
        .is_some_and(|entry| entry.handle.same_instance(&handle));
    if is_current {
        guard.remove(&conversation_id);
    }
}
