//! Tracking of open sessions.
//!
//! Sessions started through an upgrade register themselves here and deregister
//! when their receive loop ends, so the registry only ever lists live sessions.
//!
//! # Examples
//!
//! ```
//! use routeforge_core::prelude::*;
//!
//! async fn announce(ctx: HttpContext, Json(text): Json<String>) -> String {
//!     let delivered = ctx.sessions().broadcast(Message::text(text));
//!     format!("delivered to {} sessions", delivered)
//! }
//!
//! let router = Router::new().post("/announce", handler(announce));
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::websocket::message::Message;
use crate::websocket::session::{SessionId, SessionSender};

/// Open sessions by id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionSender>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns the number of open sessions.
    pub fn add(&self, sender: SessionSender) -> usize {
        let id = sender.id().clone();
        self.sessions.insert(id.clone(), sender);
        let count = self.sessions.len();
        debug!("Registered session {} (total: {})", id, count);
        count
    }

    /// Deregisters a session.
    pub fn remove(&self, id: &SessionId) -> Option<SessionSender> {
        let removed = self.sessions.remove(id).map(|(_, sender)| sender);
        if removed.is_some() {
            debug!("Removed session {} (total: {})", id, self.sessions.len());
        }
        removed
    }

    /// The sender of a session.
    pub fn get(&self, id: &SessionId) -> Option<SessionSender> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Sends to every session; returns how many accepted the message.
    pub fn broadcast(&self, message: Message) -> usize {
        self.send_where(|_| true, &message)
    }

    /// Sends to every session except `except`.
    pub fn broadcast_except(&self, except: &SessionId, message: Message) -> usize {
        self.send_where(|id| id != except, &message)
    }

    /// Sends to the listed sessions.
    pub fn send_to(&self, ids: &[SessionId], message: Message) -> usize {
        self.send_where(|id| ids.contains(id), &message)
    }

    fn send_where(&self, include: impl Fn(&SessionId) -> bool, message: &Message) -> usize {
        // collect first so no map shard stays locked while sending
        let targets: Vec<SessionSender> = self
            .sessions
            .iter()
            .filter(|entry| include(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut delivered = 0;
        for sender in targets {
            match sender.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send to session {}: {}", sender.id(), e),
            }
        }
        delivered
    }

    /// Number of open sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of all open sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebSocketConfig;
    use crate::websocket::session::tests::ScriptedTransport;
    use crate::websocket::session::{SessionInfo, WebSocketSession};
    use http::HeaderMap;

    fn open(registry: &SessionRegistry) -> (WebSocketSession, ScriptedTransportLog) {
        let transport = ScriptedTransport::new(Vec::new());
        let log = transport.sent.clone();
        let info = SessionInfo::new("/ws".to_string(), HeaderMap::new(), None, None);
        let session = WebSocketSession::start(
            transport,
            info,
            &WebSocketConfig::default(),
            Some(registry.clone()),
        );
        (session, log)
    }

    type ScriptedTransportLog = Arc<parking_lot::Mutex<Vec<Message>>>;

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (_a, log_a) = open(&registry);
        let (_b, log_b) = open(&registry);
        assert_eq!(registry.count(), 2);

        assert_eq!(registry.broadcast(Message::text("all")), 2);
        settle().await;
        assert_eq!(*log_a.lock(), vec![Message::text("all")]);
        assert_eq!(*log_b.lock(), vec![Message::text("all")]);
    }

    #[tokio::test]
    async fn test_broadcast_except_and_send_to() {
        let registry = SessionRegistry::new();
        let (a, log_a) = open(&registry);
        let (b, log_b) = open(&registry);

        assert_eq!(registry.broadcast_except(a.id(), Message::text("not a")), 1);
        assert_eq!(registry.send_to(&[a.id().clone()], Message::text("only a")), 1);
        settle().await;

        assert_eq!(*log_a.lock(), vec![Message::text("only a")]);
        assert_eq!(*log_b.lock(), vec![Message::text("not a")]);
        assert!(registry.ids().contains(b.id()));
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = SessionRegistry::new();
        let (a, _) = open(&registry);
        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
        assert_eq!(registry.count(), 0);
    }
}
