//! Error types shared across the agent.

use std::fmt::{Display, Formatter};

/// Shared agent result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Agent error enumeration covering all failure modes of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Inbound payload is well-formed JSON but misses or mistypes a field.
    Protocol(String),
    /// A payload could not be decoded or encoded as JSON.
    Serialization(String),
    /// Writing to the control-plane connection failed.
    Transport(String),
    /// No session is bound, so nothing can be delivered.
    NoActiveSession,
    /// A step action failed unexpectedly.
    Step(String),
    /// A wait step is missing the fields that identify what it waits for.
    WaitConfig(String),
    /// A watched file or its stored fingerprint could not be read or written.
    Watch(String),
    /// Process table inspection or signalling failure.
    Process(String),
    /// Scheduling an agent update failed.
    Update(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::NoActiveSession => write!(f, "transport: no active session"),
            Self::Step(msg) => write!(f, "step: {msg}"),
            Self::WaitConfig(msg) => write!(f, "wait config: {msg}"),
            Self::Watch(msg) => write!(f, "watch: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Update(msg) => write!(f, "update: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether the error is a delivery failure that a retry may fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NoActiveSession)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
