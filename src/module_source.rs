//! Module source (repository and tag) that step modules are fetched from.
//!
//! The control plane may change the source with any recipe. The latest
//! value is kept in memory for the step runner and written to
//! `state_dir/module.toml` so a restarted agent keeps using it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ModuleConfig;
use crate::{AppError, Result};

/// Repository and tag of the step modules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ModuleSource {
    /// Repository URI.
    pub repo: String,
    /// Tag or revision within the repository.
    pub tag: String,
}

impl ModuleSource {
    /// Build a module source.
    #[must_use]
    pub fn new(repo: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            tag: tag.into(),
        }
    }

    /// Whether both repo and tag are set.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.repo.trim().is_empty() && !self.tag.trim().is_empty()
    }
}

impl From<&ModuleConfig> for ModuleSource {
    fn from(config: &ModuleConfig) -> Self {
        Self::new(config.repo.clone(), config.tag.clone())
    }
}

/// Shared, optionally persisted module source.
#[derive(Debug)]
pub struct ModuleSourceStore {
    current: Mutex<ModuleSource>,
    path: Option<PathBuf>,
}

impl ModuleSourceStore {
    /// In-memory store, used when nothing should be written to disk.
    #[must_use]
    pub fn in_memory(initial: ModuleSource) -> Self {
        Self {
            current: Mutex::new(initial),
            path: None,
        }
    }

    /// Open a persisted store. A previously written file overrides `defaults`;
    /// an unreadable file is logged and ignored.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, defaults: ModuleSource) -> Self {
        let path = path.into();
        let initial = match read_source(&path) {
            Ok(Some(saved)) => {
                info!(path = %path.display(), repo = %saved.repo, tag = %saved.tag, "module source restored");
                saved
            }
            Ok(None) => defaults,
            Err(err) => {
                warn!(path = %path.display(), %err, "persisted module source ignored");
                defaults
            }
        };
        Self {
            current: Mutex::new(initial),
            path: Some(path),
        }
    }

    /// Snapshot of the current source.
    #[must_use]
    pub fn current(&self) -> ModuleSource {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the source. Returns whether anything changed.
    ///
    /// The in-memory value is updated even when persisting fails.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the new value cannot be written to disk.
    pub fn update(&self, next: ModuleSource) -> Result<bool> {
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == next {
                return Ok(false);
            }
            if current.repo != next.repo {
                info!(from = %current.repo, to = %next.repo, "module repo updated");
            }
            if current.tag != next.tag {
                info!(from = %current.tag, to = %next.tag, "module tag updated");
            }
            *current = next.clone();
        }

        if let Some(ref path) = self.path {
            write_source(path, &next)?;
        }
        Ok(true)
    }
}

fn read_source(path: &Path) -> Result<Option<ModuleSource>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let source: ModuleSource = toml::from_str(&raw)
        .map_err(|err| AppError::Config(format!("invalid module source file: {err}")))?;
    Ok(Some(source))
}

fn write_source(path: &Path, source: &ModuleSource) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string(source)
        .map_err(|err| AppError::Serialization(format!("module source: {err}")))?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
