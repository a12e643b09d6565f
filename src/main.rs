#![forbid(unsafe_code)]

//! `agent-courier`: Slack-driven agent session runner binary.
//!
//! Bootstraps configuration, the sqlite session index, the active-runner
//! registry, and the Slack Socket Mode integration, then waits for a
//! shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_courier::config::GlobalConfig;
use agent_courier::persistence::db;
use agent_courier::persistence::session_index::SqliteSessionIndex;
use agent_courier::runner::registry::ActiveRunners;
use agent_courier::runner::turn::TurnRunner;
use agent_courier::runner::SessionIndex;
use agent_courier::slack::client::{SlackMessage, SlackRuntime, SlackService};
use agent_courier::slack::sink::SlackSink;
use agent_courier::slack::EventContext;
use agent_courier::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-courier", about = "Slack-driven agent session runner", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-courier server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;

    // Override workspace root from CLI if provided.
    if let Some(ws) = args.workspace {
        let canonical = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.default_workspace_root = canonical;
    }

    // Load Slack credentials from keyring / env vars.
    config.load_credentials().await?;

    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize the session index ────────────────────
    let pool = db::connect(&config.db_path()).await?;
    let index: Arc<dyn SessionIndex> = Arc::new(SqliteSessionIndex::new(pool));
    info!("session index ready");

    // ── Assemble the runner and the Slack bridge ────────
    // The Slack service comes up first; the event context that Socket Mode
    // callbacks receive holds it, the runner, and the registry.
    let (slack, queue_task) = SlackService::connect(&config.slack).map_err(|err| {
        error!(%err, "slack service start failed");
        err
    })?;
    let slack = Arc::new(slack);
    let sink = Arc::new(SlackSink::new(Arc::clone(&slack)));
    let registry = Arc::new(ActiveRunners::new(config.inactivity_window()));
    let runner = Arc::new(TurnRunner::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        sink,
        Arc::clone(&index),
    ));
    let context = Arc::new(EventContext {
        config: Arc::clone(&config),
        runner,
        registry: Arc::clone(&registry),
        index,
        slack: Arc::clone(&slack),
    });
    let socket_task = slack.spawn_socket_listener(Arc::clone(&context));
    let slack_runtime = SlackRuntime {
        queue_task,
        socket_task,
    };
    info!(channel = %config.slack.channel_id, "agent-courier ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    let stopped = registry.kill_all().await;
    info!(stopped, "killed active agent runs");

    // Post a final notice and let the outbound queue drain briefly.
    let channel = slack_morphism::prelude::SlackChannelId(config.slack.channel_id.clone());
    let notice = if stopped == 0 {
        "\u{26a0}\u{fe0f} Server shutting down.".to_owned()
    } else {
        format!("\u{26a0}\u{fe0f} Server shutting down. Stopped {stopped} agent run(s).")
    };
    if let Err(err) = slack.enqueue(SlackMessage::plain(channel, notice)).await {
        error!(%err, "failed to post shutdown notification to slack");
    }
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    slack_runtime.socket_task.abort();
    slack_runtime.queue_task.abort();
    info!("agent-courier shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
