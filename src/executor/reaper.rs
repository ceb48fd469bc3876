//! Best-effort termination of the agent's child processes.
//!
//! Killing a recipe must not leave step modules running in the background.
//! The reaper lists the process table, picks every entry whose parent is the
//! agent, and sends it `SIGKILL`. Failures are logged and never propagated.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// One row of the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process id.
    pub pid: i32,
    /// Parent process id.
    pub parent_pid: i32,
}

/// Access to the host process table.
pub trait ProcessTable: Send + Sync {
    /// Every visible process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the table cannot be read.
    fn list(&self) -> Result<Vec<ProcessEntry>>;

    /// Forcefully terminate `pid`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the signal cannot be delivered.
    fn terminate(&self, pid: i32) -> Result<()>;
}

/// Process table read from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcFs {
    /// Read the table from an alternative procfs root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessTable for ProcFs {
    fn list(&self) -> Result<Vec<ProcessEntry>> {
        let entries = fs::read_dir(&self.root).map_err(|err| {
            AppError::Process(format!("failed to list {}: {err}", self.root.display()))
        })?;

        let mut table = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // Processes may exit between listing and reading.
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(parsed) = parse_stat(&stat) {
                table.push(parsed);
            }
        }
        Ok(table)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: i32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|err| AppError::Process(format!("failed to kill {pid}: {err}")))
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: i32) -> Result<()> {
        Err(AppError::Process(format!(
            "cannot kill {pid}: signals are not supported on this platform"
        )))
    }
}

/// Parse the pid and parent pid out of a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are read after the last `)`.
#[must_use]
pub fn parse_stat(stat: &str) -> Option<ProcessEntry> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let pid = stat.get(..open)?.trim().parse().ok()?;
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let parent_pid = rest.next()?.parse().ok()?;
    Some(ProcessEntry { pid, parent_pid })
}

/// Outcome of one reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Children that were signalled.
    pub killed: Vec<i32>,
    /// Children that could not be signalled, with the reason.
    pub failed: Vec<(i32, String)>,
}

/// Kills the direct children of one parent process.
pub struct ProcessReaper {
    table: Box<dyn ProcessTable>,
    parent_pid: i32,
}

impl ProcessReaper {
    /// Reaper for the children of the current process.
    #[must_use]
    pub fn for_current_process(table: Box<dyn ProcessTable>) -> Self {
        let parent_pid = i32::try_from(std::process::id()).unwrap_or(i32::MAX);
        Self::new(table, parent_pid)
    }

    /// Reaper for the children of `parent_pid`.
    #[must_use]
    pub fn new(table: Box<dyn ProcessTable>, parent_pid: i32) -> Self {
        Self { table, parent_pid }
    }

    /// Terminate every child of the parent. Never fails.
    pub fn reap(&self) -> ReapReport {
        let mut report = ReapReport::default();

        let table = match self.table.list() {
            Ok(table) => table,
            Err(err) => {
                warn!(%err, "process table unavailable, children left running");
                return report;
            }
        };

        for entry in table.iter().filter(|e| e.parent_pid == self.parent_pid) {
            match self.table.terminate(entry.pid) {
                Ok(()) => {
                    info!(pid = entry.pid, "child process killed");
                    report.killed.push(entry.pid);
                }
                Err(err) => {
                    warn!(pid = entry.pid, %err, "failed to kill child process");
                    report.failed.push((entry.pid, err.to_string()));
                }
            }
        }

        if report.killed.is_empty() && report.failed.is_empty() {
            debug!(parent_pid = self.parent_pid, "no child process found");
        }
        report
    }
}

impl std::fmt::Debug for ProcessReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessReaper")
            .field("parent_pid", &self.parent_pid)
            .finish_non_exhaustive()
    }
}
