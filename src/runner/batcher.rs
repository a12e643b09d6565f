//! Time-windowed coalescing buffer for streamed assistant text.
//!
//! The agent emits text in small fragments; posting each one would flood
//! the conversation. The buffer holds fragments and re-arms a flush
//! deadline on every append, so a burst of output lands as one message.
//! The orchestrator polls the deadline as a `select!` arm and calls
//! [`OutputBatcher::take`] when it passes, or eagerly before questions and
//! terminal reports.

use std::time::Duration;

use tokio::time::Instant;

/// Default flush window applied when the config omits one.
pub const DEFAULT_FLUSH_WINDOW: Duration = Duration::from_millis(2000);

/// Accumulates text fragments and tracks the pending flush deadline.
#[derive(Debug)]
pub struct OutputBatcher {
    window: Duration,
    pending: Vec<String>,
    deadline: Option<Instant>,
}

impl OutputBatcher {
    /// Create a buffer that flushes `window` after the most recent append.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            deadline: None,
        }
    }

    /// Append a text fragment and re-arm the flush deadline.
    ///
    /// Whitespace-only fragments are dropped without touching the deadline.
    pub fn append(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.pending.push(text.to_string());
        self.deadline = Some(Instant::now() + self.window);
    }

    /// Take everything buffered as one newline-joined chunk, clearing the
    /// buffer and the deadline. `None` when nothing is pending.
    pub fn take(&mut self) -> Option<String> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        let joined = self.pending.join("\n");
        self.pending.clear();
        Some(joined)
    }

    /// Whether any text is waiting to be flushed.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Current flush deadline, if armed.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until `deadline` passes, or forever when there is none.
///
/// Shaped for use as a `select!` arm: callers copy the deadline out of the
/// buffer first so the sleep future does not borrow it.
pub async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
