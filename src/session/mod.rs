//! Control-plane session: protocol codes, codec, handlers, and transport.

pub mod codec;
pub mod codes;
pub mod handlers;
pub mod manager;
pub mod outbound;
pub mod relay;
pub mod transport;

pub use codes::{CloseReason, InboundCode, OutboundCode};
pub use manager::{SessionContext, SessionManager, SessionState};
pub use outbound::{Frame, Outbound};
pub use relay::{Relay, ReportChannel};
