//! Content fingerprints for watch-gated steps.
//!
//! Each watched step keeps one record file under the watch directory, named
//! after the SHA-256 of the step id and holding the SHA-256 of the watched
//! file's content as of the last successful run.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{AppError, Result};

/// What the watched file looks like compared to its stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    /// No record exists yet.
    First {
        /// Fingerprint of the current content.
        fingerprint: String,
    },
    /// Content matches the record.
    Unchanged {
        /// Fingerprint of the current content.
        fingerprint: String,
    },
    /// Content differs from the record.
    Changed {
        /// Fingerprint of the current content.
        fingerprint: String,
    },
}

impl WatchState {
    /// Whether the step should be told its watched file changed.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }

    /// Whether the record must be written after a successful run.
    #[must_use]
    pub fn needs_record(&self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }

    /// Fingerprint of the current content.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::First { fingerprint }
            | Self::Unchanged { fingerprint }
            | Self::Changed { fingerprint } => fingerprint,
        }
    }
}

/// Compares watched files against their stored fingerprints.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    dir: PathBuf,
}

impl ChangeDetector {
    /// Detector storing its records under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Fingerprint `path` and compare it with the record of `step_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Watch` if the watched file or the record cannot be read.
    pub fn check(&self, step_id: &str, path: &Path) -> Result<WatchState> {
        let fingerprint = fingerprint_file(path)?;
        let state = match self.stored(step_id)? {
            None => WatchState::First { fingerprint },
            Some(stored) if stored == fingerprint => WatchState::Unchanged { fingerprint },
            Some(_) => WatchState::Changed { fingerprint },
        };
        Ok(state)
    }

    /// Stored fingerprint for `step_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Watch` if the record exists but cannot be read.
    pub fn stored(&self, step_id: &str) -> Result<Option<String>> {
        let path = self.record_path(step_id);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw.trim().to_owned())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Watch(format!(
                "failed to read record {}: {err}",
                path.display()
            ))),
        }
    }

    /// Persist `fingerprint` as the record for `step_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Watch` if the record cannot be written.
    pub fn record(&self, step_id: &str, fingerprint: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::Watch(format!(
                "failed to create watch dir {}: {err}",
                self.dir.display()
            ))
        })?;

        // Temp file plus rename: readers never see a partial record.
        let path = self.record_path(step_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, fingerprint)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|err| {
                AppError::Watch(format!("failed to write record {}: {err}", path.display()))
            })
    }

    fn record_path(&self, step_id: &str) -> PathBuf {
        self.dir.join(sha256_hex(step_id.as_bytes()))
    }
}

/// SHA-256 hex digest of the file at `path`.
///
/// # Errors
///
/// Returns `AppError::Watch` if the file cannot be read.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let content = fs::read(path).map_err(|err| {
        AppError::Watch(format!("failed to read watched file {}: {err}", path.display()))
    })?;
    Ok(sha256_hex(&content))
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
