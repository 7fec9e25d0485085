//! WebSocket upgrades and sessions.
//!
//! A handler takes a [`WebSocketUpgrade`] argument to accept a handshake. Once the
//! `101` response is on the wire the connection becomes a [`WebSocketSession`]
//! whose receive loop reports [`SessionEvent`]s until the peer closes.

pub mod message;
pub mod registry;
pub mod session;
pub mod upgrade;

pub use message::{CloseInfo, Message, MessageType};
pub use registry::SessionRegistry;
pub use session::{
    Fragment, FragmentKind, SessionEvent, SessionId, SessionInfo, SessionSender, SessionState,
    SessionSummary, Transport, TungsteniteTransport, WebSocketSession,
};
pub use upgrade::{PendingUpgrade, WebSocketUpgrade, compute_accept_key, validate_handshake};
