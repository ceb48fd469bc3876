//! Numeric message and close codes of the control-plane protocol.

/// Codes of messages sent by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCode {
    /// Identity exchange opening a session.
    Handshake,
    /// Step report.
    StateLog,
}

impl OutboundCode {
    /// Wire value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Handshake => 1,
            Self::StateLog => 2,
        }
    }
}

/// Codes of messages the agent acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCode {
    /// The control plane does not know this instance's application.
    AppNotExist,
    /// A new agent build is available.
    AgentUpdate,
    /// A recipe to execute.
    RecipeData,
    /// A wait step has been satisfied.
    WaitDone,
}

impl InboundCode {
    /// Map a wire value to a known code.
    #[must_use]
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            3 => Some(Self::AppNotExist),
            4 => Some(Self::AgentUpdate),
            5 => Some(Self::RecipeData),
            6 => Some(Self::WaitDone),
            _ => None,
        }
    }

    /// Wire value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::AppNotExist => 3,
            Self::AgentUpdate => 4,
            Self::RecipeData => 5,
            Self::WaitDone => 6,
        }
    }
}

/// Why the agent closes a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown.
    Stop,
    /// An inbound message was not valid JSON.
    InvalidJsonReceived,
    /// An outbound message could not be serialized.
    InvalidJsonSend,
    /// Writing to the connection failed.
    WriteFailed,
}

impl CloseReason {
    /// WebSocket close code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Stop => 4000,
            Self::InvalidJsonReceived => 4001,
            Self::InvalidJsonSend => 4002,
            Self::WriteFailed => 4003,
        }
    }

    /// Human-readable close reason.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Stop => "agent stopping",
            Self::InvalidJsonReceived => "invalid json received",
            Self::InvalidJsonSend => "invalid json to send",
            Self::WriteFailed => "write failed",
        }
    }

    /// Whether closing for this reason also resets recipe execution.
    #[must_use]
    pub fn resets_execution(self) -> bool {
        matches!(self, Self::InvalidJsonReceived | Self::InvalidJsonSend)
    }
}

/// Close code reported when the connection drops without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;
