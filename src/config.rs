//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service name under which Slack tokens are stored.
const KEYRING_SERVICE: &str = "agent-courier";

/// Nested Slack configuration for Socket Mode connectivity.
///
/// Tokens are loaded at runtime via OS keychain or environment variables,
/// not from the TOML config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackConfig {
    /// Channel whose messages drive the agent.
    pub channel_id: String,
    /// App-level token used for Socket Mode (populated at runtime).
    #[serde(skip)]
    pub app_token: String,
    /// Bot user token used for posting messages (populated at runtime).
    #[serde(skip)]
    pub bot_token: String,
}

/// Runner behavior knobs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfig {
    /// Idle window before a silent agent process is killed.
    #[serde(default = "default_inactivity_timeout_seconds")]
    pub inactivity_timeout_seconds: u64,
    /// Quiet period before buffered agent output is flushed to chat.
    #[serde(default = "default_flush_window_millis")]
    pub flush_window_millis: u64,
    /// Answer agent questions automatically instead of asking the human.
    #[serde(default)]
    pub autopilot: bool,
}

fn default_inactivity_timeout_seconds() -> u64 {
    300
}

fn default_flush_window_millis() -> u64 {
    2000
}

fn default_agent_binary() -> String {
    "claude".into()
}

/// Global configuration parsed from `agent-courier.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace root the agent works under when a conversation has no
    /// per-channel project directory.
    pub default_workspace_root: PathBuf,
    /// Slack connectivity settings.
    pub slack: SlackConfig,
    /// Authorized Slack user IDs allowed to drive the agent.
    pub authorized_user_ids: Vec<String>,
    /// Agent CLI binary (e.g., `claude`).
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    /// Extra arguments appended to every agent CLI invocation.
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// Runner timing and autopilot settings.
    pub runner: RunnerConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load Slack credentials from OS keychain with env-var fallback.
    ///
    /// Tries the `agent-courier` keyring service first, then falls back to
    /// `SLACK_APP_TOKEN` / `SLACK_BOT_TOKEN` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env vars provide
    /// the required tokens.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.slack.app_token = load_credential("slack_app_token", "SLACK_APP_TOKEN").await?;
        self.slack.bot_token = load_credential("slack_bot_token", "SLACK_BOT_TOKEN").await?;
        Ok(())
    }

    /// Path of the sqlite session index.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.default_workspace_root
            .join(".agent-courier")
            .join("sessions.db")
    }

    /// Flush window for the output batching buffer.
    #[must_use]
    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.runner.flush_window_millis)
    }

    /// Inactivity window for the runner watchdog.
    #[must_use]
    pub fn inactivity_window(&self) -> Duration {
        Duration::from_secs(self.runner.inactivity_timeout_seconds)
    }

    /// Project directory for a new conversation in the given channel: the
    /// channel's subdirectory under the workspace root when one exists,
    /// otherwise the root itself.
    #[must_use]
    pub fn workspace_for(&self, channel_id: &str) -> PathBuf {
        let candidate = self.default_workspace_root.join(channel_id);
        if candidate.is_dir() {
            candidate
        } else {
            self.default_workspace_root.clone()
        }
    }

    /// Validate that a Slack user is authorized to drive the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` if the user is not in the allowed list.
    pub fn ensure_authorized(&self, user_id: &str) -> Result<()> {
        if self.authorized_user_ids.iter().any(|id| id == user_id) {
            Ok(())
        } else {
            Err(AppError::Unauthorized("user is not authorized".into()))
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.authorized_user_ids.is_empty() {
            return Err(AppError::Config(
                "authorized_user_ids must not be empty".into(),
            ));
        }

        if self.slack.channel_id.is_empty() {
            return Err(AppError::Config("slack.channel_id must be set".into()));
        }

        if self.agent_binary.is_empty() {
            return Err(AppError::Config("agent_binary must not be empty".into()));
        }

        if self.runner.flush_window_millis == 0 {
            return Err(AppError::Config(
                "runner.flush_window_millis must be greater than zero".into(),
            ));
        }

        if self.runner.inactivity_timeout_seconds == 0 {
            return Err(AppError::Config(
                "runner.inactivity_timeout_seconds must be greater than zero".into(),
            ));
        }

        let canonical_root = self
            .default_workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("default_workspace_root invalid: {err}")))?;
        self.default_workspace_root = canonical_root;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // Try OS keychain first via spawn_blocking (keyring is synchronous I/O).
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    // Fallback to environment variable.
    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
