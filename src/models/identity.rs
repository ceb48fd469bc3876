//! Instance identity presented to the control plane.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IdentityConfig;
use crate::Result;

/// Who this agent is; sent in the handshake and attached to every report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Identity {
    /// Instance identifier.
    pub instance_id: String,
    /// Owning application.
    pub app_id: String,
    /// Instance token, empty when none is provisioned.
    pub instance_token: String,
}

/// Source of the current identity; consulted on connect and on every
/// handshake rejection.
pub trait IdentityProvider: Send + Sync {
    /// Return a fresh identity.
    ///
    /// # Errors
    ///
    /// Implementations return an error when the identity cannot be resolved.
    fn identity(&self) -> Result<Identity>;
}

/// Identity backed by the configuration file and an optional token file.
#[derive(Debug, Clone)]
pub struct ConfigIdentity {
    instance_id: String,
    app_id: String,
    token_file: Option<PathBuf>,
}

impl ConfigIdentity {
    /// Build a provider from the `[identity]` section.
    #[must_use]
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            app_id: config.app_id.clone(),
            token_file: config.token_file.clone(),
        }
    }

    fn read_token(&self) -> String {
        let Some(ref path) = self.token_file else {
            return String::new();
        };
        match fs::read_to_string(path) {
            Ok(raw) => raw.trim().to_owned(),
            Err(err) => {
                warn!(path = %path.display(), %err, "instance token unreadable, using empty token");
                String::new()
            }
        }
    }
}

impl IdentityProvider for ConfigIdentity {
    fn identity(&self) -> Result<Identity> {
        let identity = Identity {
            instance_id: self.instance_id.clone(),
            app_id: self.app_id.clone(),
            instance_token: self.read_token(),
        };
        debug!(
            instance_id = %identity.instance_id,
            app_id = %identity.app_id,
            "identity resolved"
        );
        Ok(identity)
    }
}
