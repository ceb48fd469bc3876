//! Scheduling of agent self-updates.
//!
//! The agent never updates itself in-process. It installs a crontab entry
//! that runs the packaged `update.sh` once a minute until the script
//! replaces the entry.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::info;

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Plans an agent update.
pub trait UpdateScheduler: Send + Sync {
    /// Schedule the update to `version`, fetched from `url`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Update` if the update cannot be planned.
    fn schedule(&self, version: &str, url: &str) -> Result<()>;
}

/// Installs the update job with `crontab -`.
#[derive(Debug, Clone)]
pub struct CrontabScheduler {
    script: PathBuf,
    app_id: String,
    log_file: PathBuf,
    crontab: String,
}

impl CrontabScheduler {
    /// Scheduler built from the configured script and log directories.
    #[must_use]
    pub fn new(config: &GlobalConfig) -> Self {
        Self {
            script: config.paths.scripts_dir.join("update.sh"),
            app_id: config.identity.app_id.clone(),
            log_file: config.paths.log_dir.join("bootstrap.log"),
            crontab: "crontab".into(),
        }
    }

    /// Use another `crontab` binary.
    #[must_use]
    pub fn with_crontab(mut self, program: impl Into<String>) -> Self {
        self.crontab = program.into();
        self
    }

    /// The crontab line installed for `version` and `url`.
    #[must_use]
    pub fn entry(&self, version: &str, url: &str) -> String {
        format!(
            "*/1 * * * * {} {} {} {} >> {} 2>&1\n",
            shell_quote(&self.script.to_string_lossy()),
            shell_quote(url),
            shell_quote(&self.app_id),
            shell_quote(version),
            shell_quote(&self.log_file.to_string_lossy()),
        )
    }
}

impl UpdateScheduler for CrontabScheduler {
    fn schedule(&self, version: &str, url: &str) -> Result<()> {
        let entry = self.entry(version, url);

        let mut child = Command::new(&self.crontab)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::Update(format!("failed to run {}: {err}", self.crontab)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(entry.as_bytes())
                .map_err(|err| AppError::Update(format!("failed to write crontab: {err}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|err| AppError::Update(format!("crontab did not finish: {err}")))?;
        if !output.status.success() {
            return Err(AppError::Update(format!(
                "crontab exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(version, url, "agent update planned");
        Ok(())
    }
}

/// Single-quote `value` for `/bin/sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
