//! Agent CLI subprocess driver.
//!
//! [`AgentProcess`] owns the lifecycle of one agent CLI invocation: spawn
//! with `kill_on_drop(true)`, pump its stream-json stdout into typed
//! [`AgentEvent`]s, accumulate stderr for diagnostics, and reap the child.
//! The handle is cheaply cloneable; the registry and the orchestrator hold
//! clones of the same instance.
//!
//! Event-stream guarantees:
//! - `Exit` is the final event; the channel closes after it.
//! - `Init` and `Result` are forwarded at most once per process, and a
//!   `ToolUse` carrying an id at most once per id. Tool invocations without
//!   an id are always forwarded; ids are never synthesized for them, so
//!   replayed id-less records are a known, accepted duplicate source.
//! - Spawn failures never surface as errors from [`AgentProcess::start`];
//!   they arrive in-band as `Error` followed by `Exit { code: None }`.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::models::question::Question;
use crate::models::turn::{PromptAttachment, TurnRequest};
use crate::runner::decoder::{parse_line, ProtocolRecord, StreamCodec};
use crate::runner::{AgentEvent, AgentFailure};

/// Tool name the CLI uses for interactive questions.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// Tool name the CLI uses to request plan approval.
pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

/// Bounded event-channel capacity. A slow consumer applies backpressure to
/// the stdout pump instead of buffering unbounded agent output.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How many characters of stderr the tail accessor keeps for diagnostics.
const STDERR_TAIL_CHARS: usize = 1000;

/// Launch parameters for one agent CLI invocation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Agent CLI binary name or path.
    pub binary: String,
    /// Extra arguments appended after the fixed protocol flags.
    pub extra_args: Vec<String>,
    /// Working directory for the child process.
    pub directory: std::path::PathBuf,
    /// Prompt text; in attachment mode it travels via stdin instead of argv.
    pub prompt: String,
    /// Prior agent session to resume.
    pub resume_session_id: Option<String>,
    /// Image attachments; non-empty switches to attachment mode.
    pub attachments: Vec<PromptAttachment>,
}

impl LaunchSpec {
    /// Build a launch spec for `request` using the configured binary and
    /// extra arguments.
    #[must_use]
    pub fn for_request(request: &TurnRequest, binary: &str, extra_args: &[String]) -> Self {
        Self {
            binary: binary.to_owned(),
            extra_args: extra_args.to_vec(),
            directory: request.directory.clone(),
            prompt: request.prompt.clone(),
            resume_session_id: request.session_id.clone(),
            attachments: request.attachments.clone(),
        }
    }
}

/// Shared state behind every clone of an [`AgentProcess`].
struct ProcessShared {
    conversation_id: String,
    /// OS pid while the child is alive; cleared when the pump reaps it.
    pid: Mutex<Option<u32>>,
    /// Latest session id announced by an init record.
    session_id: Mutex<Option<String>>,
    /// Accumulated stderr output.
    stderr: Mutex<String>,
    /// Set by [`AgentProcess::kill`]; marks the exit as intentional.
    killed: AtomicBool,
    /// Guards against a second `start` on the same handle.
    started: AtomicBool,
}

/// Cloneable handle to one agent CLI subprocess.
///
/// Clones share state; `same_instance` distinguishes handles of different
/// processes for the registry's identity guard.
#[derive(Clone)]
pub struct AgentProcess {
    inner: Arc<ProcessShared>,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("conversation_id", &self.inner.conversation_id)
            .field("pid", &*lock_ignore_poison(&self.inner.pid))
            .finish_non_exhaustive()
    }
}

impl AgentProcess {
    /// Create an idle handle for `conversation_id`. No process exists until
    /// [`AgentProcess::start`] is called.
    #[must_use]
    pub fn new(conversation_id: &str) -> Self {
        Self {
            inner: Arc::new(ProcessShared {
                conversation_id: conversation_id.to_owned(),
                pid: Mutex::new(None),
                session_id: Mutex::new(None),
                stderr: Mutex::new(String::new()),
                killed: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Conversation this process belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Whether `other` is a clone of this very handle, as opposed to a
    /// handle of some other process for the same conversation.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Latest session id the process announced, if any.
    #[must_use]
    pub fn current_session_id(&self) -> Option<String> {
        lock_ignore_poison(&self.inner.session_id).clone()
    }

    /// Everything the process wrote to stderr so far.
    #[must_use]
    pub fn stderr_output(&self) -> String {
        lock_ignore_poison(&self.inner.stderr).clone()
    }

    /// Last [`STDERR_TAIL_CHARS`] characters of stderr, for failure logs.
    /// Truncation respects character boundaries.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        let full = lock_ignore_poison(&self.inner.stderr);
        match full.char_indices().rev().nth(STDERR_TAIL_CHARS - 1) {
            Some((start, _)) => full[start..].to_owned(),
            None => full.clone(),
        }
    }

    /// Spawn the agent CLI and return the event stream for this process.
    ///
    /// Argument order: `--resume <id>` when resuming, then `-p <prompt>`
    /// (prompt mode) or `--input-format stream-json` (attachment mode),
    /// then the fixed protocol flags, then configured extra arguments. In
    /// attachment mode a single user message carrying the prompt and
    /// base64-encoded image blocks is written to stdin, which is then
    /// closed.
    ///
    /// Never fails: a spawn problem is delivered through the returned
    /// channel as `Error` followed by `Exit { code: None }`. Calling
    /// `start` twice on one handle yields an empty, closed stream.
    pub fn start(&self, spec: LaunchSpec) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!(
                conversation_id = %self.inner.conversation_id,
                "ignoring second start on an agent process handle"
            );
            return rx;
        }

        let attachment_mode = !spec.attachments.is_empty();
        let mut cmd = Command::new(&spec.binary);
        if let Some(session_id) = &spec.resume_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        if attachment_mode {
            cmd.arg("--input-format").arg("stream-json");
        } else {
            cmd.arg("-p").arg(&spec.prompt);
        }
        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions");
        cmd.args(&spec.extra_args);
        cmd.current_dir(&spec.directory)
            .stdin(if attachment_mode {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let cause = if err.kind() == std::io::ErrorKind::NotFound {
                    AgentFailure::BinaryNotFound {
                        binary: spec.binary.clone(),
                    }
                } else {
                    AgentFailure::Spawn {
                        detail: err.to_string(),
                    }
                };
                warn!(
                    conversation_id = %self.inner.conversation_id,
                    binary = %spec.binary,
                    %err,
                    "failed to spawn agent process"
                );
                deliver_failure(&tx, cause);
                return rx;
            }
        };

        *lock_ignore_poison(&self.inner.pid) = child.id();
        info!(
            conversation_id = %self.inner.conversation_id,
            pid = ?child.id(),
            resume = spec.resume_session_id.is_some(),
            attachment_mode,
            "spawned agent process"
        );

        let Some(stdout) = child.stdout.take() else {
            deliver_failure(
                &tx,
                AgentFailure::Spawn {
                    detail: "failed to capture agent stdout".to_owned(),
                },
            );
            child.start_kill().ok();
            return rx;
        };

        if attachment_mode {
            if let Some(stdin) = child.stdin.take() {
                let message = user_message_json(&spec.prompt, &spec.attachments);
                let conversation_id = self.inner.conversation_id.clone();
                // Written from its own task so a child that floods stdout
                // before reading stdin cannot deadlock the pump.
                tokio::spawn(async move {
                    let mut stdin = stdin;
                    let mut bytes = message.into_bytes();
                    bytes.push(b'\n');
                    if let Err(err) = stdin.write_all(&bytes).await {
                        warn!(conversation_id, %err, "failed to write user message to agent stdin");
                    }
                    if let Err(err) = stdin.shutdown().await {
                        debug!(conversation_id, %err, "failed to close agent stdin");
                    }
                });
            } else {
                warn!(
                    conversation_id = %self.inner.conversation_id,
                    "agent stdin unavailable; attachments not delivered"
                );
            }
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(collect_stderr(stderr, inner))
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(pump_events(child, stdout, stderr_task, tx, inner));
        rx
    }

    /// Terminate the running process, if any.
    ///
    /// POSIX sends SIGTERM to the child pid; Windows asks `taskkill` for a
    /// process-tree kill and falls back to a plain forced kill. Safe to
    /// call with no live process and never returns an error; signal
    /// failures are logged.
    pub async fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        let pid = *lock_ignore_poison(&self.inner.pid);
        let Some(pid) = pid else {
            debug!(
                conversation_id = %self.inner.conversation_id,
                "kill requested with no live process"
            );
            return;
        };
        info!(
            conversation_id = %self.inner.conversation_id,
            pid,
            "killing agent process"
        );
        terminate_pid(pid, &self.inner.conversation_id).await;
    }
}

// ── Event mapping ─────────────────────────────────────────────────────────────

/// Turns decoded protocol records into deduplicated [`AgentEvent`]s.
///
/// De-duplication state lives for one process: init once, result once,
/// each tool-use id once. Special interactive tools yield their dedicated
/// event in addition to the generic `ToolUse`.
#[derive(Debug, Default)]
pub struct EventMapper {
    init_seen: bool,
    result_seen: bool,
    seen_tool_ids: HashSet<String>,
}

#[derive(Deserialize)]
struct AskUserInput {
    questions: Vec<Question>,
}

impl EventMapper {
    /// Fresh mapper with empty de-duplication state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one stdout line to zero or more events.
    #[must_use]
    pub fn map_line(&mut self, line: &str) -> Vec<AgentEvent> {
        parse_line(line)
            .into_iter()
            .flat_map(|record| self.map_record(record))
            .collect()
    }

    /// Map one protocol record, applying de-duplication.
    #[must_use]
    pub fn map_record(&mut self, record: ProtocolRecord) -> Vec<AgentEvent> {
        match record {
            ProtocolRecord::Init { session_id, model } => {
                if self.init_seen {
                    debug!(session_id, "dropping duplicate init record");
                    return Vec::new();
                }
                self.init_seen = true;
                vec![AgentEvent::Init { session_id, model }]
            }
            ProtocolRecord::AssistantText { text } => vec![AgentEvent::Text { text }],
            ProtocolRecord::AssistantToolUse { id, name, input } => {
                if let Some(id) = &id {
                    if !self.seen_tool_ids.insert(id.clone()) {
                        debug!(tool_use_id = %id, "dropping duplicate tool_use record");
                        return Vec::new();
                    }
                }
                let mut events = Vec::with_capacity(2);
                let special = special_tool_event(&name, &input);
                events.push(AgentEvent::ToolUse { id, name, input });
                if let Some(event) = special {
                    events.push(event);
                }
                events
            }
            ProtocolRecord::Result {
                result,
                total_cost_usd,
            } => {
                if self.result_seen {
                    debug!("dropping duplicate result record");
                    return Vec::new();
                }
                self.result_seen = true;
                vec![AgentEvent::Result {
                    result_text: result,
                    cost_usd: total_cost_usd,
                }]
            }
        }
    }
}

/// Dedicated event for the interactive tools, when `name` is one of them.
///
/// Malformed `AskUserQuestion` input degrades to the generic `ToolUse`
/// alone rather than suppressing the record.
fn special_tool_event(name: &str, input: &Value) -> Option<AgentEvent> {
    match name {
        ASK_USER_TOOL => match serde_json::from_value::<AskUserInput>(input.clone()) {
            Ok(parsed) => Some(AgentEvent::AskUser {
                questions: parsed.questions,
            }),
            Err(err) => {
                warn!(%err, "malformed AskUserQuestion input; passing through as plain tool use");
                None
            }
        },
        EXIT_PLAN_TOOL => Some(AgentEvent::ExitPlanMode),
        _ => None,
    }
}

// ── Pump task ─────────────────────────────────────────────────────────────────

/// Read stdout to EOF, forward mapped events, then reap the child and emit
/// the final `Exit` event.
async fn pump_events(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr_task: Option<JoinHandle<()>>,
    tx: mpsc::Sender<AgentEvent>,
    inner: Arc<ProcessShared>,
) {
    let mut mapper = EventMapper::new();
    let mut framed = FramedRead::new(stdout, StreamCodec::new());
    let mut receiver_gone = false;

    while let Some(item) = framed.next().await {
        match item {
            Ok(line) => {
                for event in mapper.map_line(&line) {
                    if let AgentEvent::Init { session_id, .. } = &event {
                        *lock_ignore_poison(&inner.session_id) = Some(session_id.clone());
                    }
                    if !receiver_gone && tx.send(event).await.is_err() {
                        // Listener dropped mid-turn; keep draining stdout so
                        // the child never blocks on a full pipe and can be
                        // reaped, but stop forwarding.
                        debug!(
                            conversation_id = %inner.conversation_id,
                            "event receiver dropped; draining agent stdout"
                        );
                        receiver_gone = true;
                    }
                }
            }
            Err(err) => {
                warn!(
                    conversation_id = %inner.conversation_id,
                    %err,
                    "skipping undecodable stdout frame"
                );
            }
        }
    }

    if let Some(task) = stderr_task {
        if let Err(err) = task.await {
            warn!(
                conversation_id = %inner.conversation_id,
                %err,
                "stderr collector task failed"
            );
        }
    }

    let status = child.wait().await;
    *lock_ignore_poison(&inner.pid) = None;
    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(
                conversation_id = %inner.conversation_id,
                %err,
                "error waiting for agent process"
            );
            None
        }
    };
    // POSIX reports signal deaths as a missing code already; taskkill on
    // Windows surfaces a numeric code, so the intentional-kill flag maps it
    // back to the silent form.
    #[cfg(windows)]
    let code = if inner.killed.load(Ordering::SeqCst) {
        None
    } else {
        code
    };

    info!(
        conversation_id = %inner.conversation_id,
        exit_code = ?code,
        intentional = inner.killed.load(Ordering::SeqCst),
        "agent process exited"
    );
    if !receiver_gone && tx.send(AgentEvent::Exit { code }).await.is_err() {
        debug!(
            conversation_id = %inner.conversation_id,
            "event receiver dropped before exit event"
        );
    }
}

/// Append everything the child writes to stderr into shared state.
async fn collect_stderr(mut stderr: ChildStderr, inner: Arc<ProcessShared>) {
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                lock_ignore_poison(&inner.stderr).push_str(&chunk);
            }
            Err(err) => {
                debug!(
                    conversation_id = %inner.conversation_id,
                    %err,
                    "stderr read failed"
                );
                break;
            }
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Push the spawn-failure event pair into a fresh channel.
///
/// The channel was just created, so `try_send` has capacity for both
/// events.
fn deliver_failure(tx: &mpsc::Sender<AgentEvent>, cause: AgentFailure) {
    if tx.try_send(AgentEvent::Error { cause }).is_err() {
        warn!("failed to enqueue spawn error event");
    }
    if tx.try_send(AgentEvent::Exit { code: None }).is_err() {
        warn!("failed to enqueue spawn exit event");
    }
}

/// Serialize the attachment-mode user message.
fn user_message_json(prompt: &str, attachments: &[PromptAttachment]) -> String {
    use base64::Engine as _;

    let mut content = vec![json!({ "type": "text", "text": prompt })];
    for attachment in attachments {
        content.push(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": attachment.media_type,
                "data": base64::engine::general_purpose::STANDARD.encode(&attachment.data),
            }
        }));
    }
    json!({
        "type": "user",
        "message": { "role": "user", "content": content }
    })
    .to_string()
}

/// Send the platform's termination request to `pid`.
#[cfg(unix)]
#[allow(clippy::unused_async)] // Signature matches the Windows taskkill path.
async fn terminate_pid(pid: u32, conversation_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => {
            if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(conversation_id, pid, %err, "failed to signal agent process");
            }
        }
        Err(_) => warn!(conversation_id, pid, "agent pid out of signal range"),
    }
}

/// Send the platform's termination request to `pid`.
#[cfg(windows)]
async fn terminate_pid(pid: u32, conversation_id: &str) {
    // Tree kill first so CLI-spawned helpers die too; plain forced kill as
    // the fallback.
    let tree = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await;
    let tree_ok = matches!(&tree, Ok(output) if output.status.success());
    if tree_ok {
        return;
    }
    if let Err(err) = &tree {
        warn!(conversation_id, pid, %err, "taskkill /T failed to run");
    }
    match Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            conversation_id,
            pid,
            status = ?output.status,
            "taskkill fallback reported failure"
        ),
        Err(err) => warn!(conversation_id, pid, %err, "taskkill fallback failed to run"),
    }
}

/// Lock a mutex, recovering the inner data if a panic poisoned it.
fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
