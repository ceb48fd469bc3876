//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Control-plane connectivity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NetworkConfig {
    /// WebSocket endpoint of the control plane.
    pub ws_uri: String,
}

/// Static identity of this instance within its application.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IdentityConfig {
    /// Instance identifier presented during the handshake.
    pub instance_id: String,
    /// Application the instance belongs to.
    pub app_id: String,
    /// File holding the instance token; re-read on every identity refresh.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

/// Where step modules come from and how they are run.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ModuleConfig {
    /// Default module repository; may be empty until the control plane sends one.
    #[serde(default)]
    pub repo: String,
    /// Default module tag.
    #[serde(default)]
    pub tag: String,
    /// Program invoked for every non-builtin step.
    #[serde(default = "default_runner")]
    pub runner: String,
    /// Arguments passed to the runner before the module name.
    #[serde(default)]
    pub runner_args: Vec<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            tag: String::new(),
            runner: default_runner(),
            runner_args: Vec::new(),
        }
    }
}

fn default_runner() -> String {
    "recipe-module".into()
}

/// File-system locations used by the agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Root for watch records and the persisted module source.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory holding `update.sh`.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Directory for update logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            scripts_dir: default_scripts_dir(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/recipe-agent")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/usr/share/recipe-agent/scripts")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/recipe-agent")
}

/// Fixed delays used by the retry policies.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingConfig {
    /// Delay between report delivery attempts.
    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,
    /// Delay before a failed step is retried.
    #[serde(default = "default_step_retry_delay_ms")]
    pub step_retry_delay_ms: u64,
    /// Back-off before re-issuing a rejected handshake.
    #[serde(default = "default_handshake_retry_seconds")]
    pub handshake_retry_seconds: u64,
    /// Pause between two connection attempts.
    #[serde(default = "default_reconnect_seconds")]
    pub reconnect_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            resend_delay_ms: default_resend_delay_ms(),
            step_retry_delay_ms: default_step_retry_delay_ms(),
            handshake_retry_seconds: default_handshake_retry_seconds(),
            reconnect_seconds: default_reconnect_seconds(),
        }
    }
}

impl TimingConfig {
    /// Delay between report delivery attempts.
    #[must_use]
    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }

    /// Delay before a failed step is retried.
    #[must_use]
    pub fn step_retry_delay(&self) -> Duration {
        Duration::from_millis(self.step_retry_delay_ms)
    }

    /// Back-off before re-issuing a rejected handshake.
    #[must_use]
    pub fn handshake_retry(&self) -> Duration {
        Duration::from_secs(self.handshake_retry_seconds)
    }

    /// Pause between two connection attempts.
    #[must_use]
    pub fn reconnect(&self) -> Duration {
        Duration::from_secs(self.reconnect_seconds)
    }
}

fn default_resend_delay_ms() -> u64 {
    1000
}

fn default_step_retry_delay_ms() -> u64 {
    1000
}

fn default_handshake_retry_seconds() -> u64 {
    30
}

fn default_reconnect_seconds() -> u64 {
    10
}

/// Global configuration parsed from `agent.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Control-plane connectivity.
    pub network: NetworkConfig,
    /// Instance identity.
    pub identity: IdentityConfig,
    /// Module source defaults and runner.
    #[serde(default)]
    pub module: ModuleConfig,
    /// File-system locations.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Retry delays.
    #[serde(default)]
    pub timing: TimingConfig,
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

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory holding one fingerprint record per watched step.
    #[must_use]
    pub fn watch_dir(&self) -> PathBuf {
        self.paths.state_dir.join("watch")
    }

    /// File the module source is persisted to once the control plane changes it.
    #[must_use]
    pub fn module_source_path(&self) -> PathBuf {
        self.paths.state_dir.join("module.toml")
    }

    fn validate(&self) -> Result<()> {
        let uri = self.network.ws_uri.trim();
        if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "network.ws_uri must be a ws:// or wss:// url, got '{uri}'"
            )));
        }

        if self.identity.instance_id.trim().is_empty() {
            return Err(AppError::Config(
                "identity.instance_id must not be empty".into(),
            ));
        }

        if self.identity.app_id.trim().is_empty() {
            return Err(AppError::Config("identity.app_id must not be empty".into()));
        }

        if self.module.runner.trim().is_empty() {
            return Err(AppError::Config("module.runner must not be empty".into()));
        }

        Ok(())
    }
}
