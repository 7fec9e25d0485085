//! WebSocket sessions and their receive loop.
//!
//! Every session runs one task that owns the underlying [`Transport`]. The task
//! receives fragments into a bounded buffer, reassembles them into complete
//! messages and reports them as [`SessionEvent`]s. Outgoing messages are queued by
//! [`SessionSender`]s and written by the same task.
//!
//! ```text
//! Connecting ──> Open ──> Closing ──> Closed
//! ```
//!
//! A close frame from the peer raises [`SessionEvent::Closed`], is acknowledged and
//! ends the loop. A transport error ends the loop with close code 1006.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::websocket::message::{CloseInfo, Message, MessageType};
use crate::websocket::registry::SessionRegistry;

/// Identifier of a session, unique within the process.
pub type SessionId = String;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> SessionId {
    format!("ws-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The receive loop has not started.
    Connecting,
    /// Messages flow in both directions.
    Open,
    /// A close frame was sent or received.
    Closing,
    /// The receive loop has ended.
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Connecting as u8))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Handshake metadata, shared read-only between the session and its handler.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    id: SessionId,
    path: String,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    protocol: Option<String>,
    connected_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Creates metadata with a fresh session id.
    pub fn new(
        path: String,
        headers: HeaderMap,
        remote_addr: Option<SocketAddr>,
        protocol: Option<String>,
    ) -> Self {
        Self {
            id: next_session_id(),
            path,
            headers,
            remote_addr,
            protocol,
            connected_at: Utc::now(),
        }
    }

    /// The session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The request path the session was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Headers of the handshake request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// When the upgrade was accepted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// A serializable summary.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            path: self.path.clone(),
            remote_addr: self.remote_addr.map(|a| a.to_string()),
            protocol: self.protocol.clone(),
            connected_at: self.connected_at.timestamp(),
        }
    }
}

/// Serializable view of [`SessionInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: SessionId,
    /// Request path.
    pub path: String,
    /// Peer address.
    pub remote_addr: Option<String>,
    /// Negotiated subprotocol.
    pub protocol: Option<String>,
    /// Unix timestamp of the upgrade.
    pub connected_at: i64,
}

/// Kind of a received fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Part of a text message.
    Text,
    /// Part of a binary message.
    Binary,
    /// A close frame.
    Close,
}

/// One chunk of an incoming message.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// What the fragment belongs to.
    pub kind: FragmentKind,
    /// Payload bytes, at most the requested length.
    pub payload: Bytes,
    /// Whether this is the last fragment of its message.
    pub end_of_message: bool,
    /// Close status, for close fragments.
    pub close: Option<CloseInfo>,
}

impl Fragment {
    /// A data fragment.
    pub fn data(kind: FragmentKind, payload: impl Into<Bytes>, end_of_message: bool) -> Self {
        Self {
            kind,
            payload: payload.into(),
            end_of_message,
            close: None,
        }
    }

    /// A close fragment.
    pub fn close(info: CloseInfo) -> Self {
        Self {
            kind: FragmentKind::Close,
            payload: Bytes::new(),
            end_of_message: true,
            close: Some(info),
        }
    }
}

/// The framing layer a session runs on.
///
/// `receive` must be cancel safe: it may be dropped before completing when an
/// outgoing message is ready, and a later call must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Receives the next fragment, with a payload of at most `max_len` bytes.
    async fn receive(&mut self, max_len: usize) -> Result<Fragment>;

    /// Sends a complete message.
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Sends a close frame.
    async fn close(&mut self, info: &CloseInfo) -> Result<()>;
}

/// [`Transport`] over a tungstenite stream.
///
/// Tungstenite delivers whole messages; they are handed out in chunks of the
/// requested size. Pings are answered by tungstenite and never surface.
pub struct TungsteniteTransport<S> {
    stream: WebSocketStream<S>,
    pending: Option<(FragmentKind, Bytes)>,
}

impl<S> TungsteniteTransport<S> {
    /// Wraps an established stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            pending: None,
        }
    }
}

#[async_trait]
impl<S> Transport for TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&mut self, max_len: usize) -> Result<Fragment> {
        loop {
            if let Some((kind, mut rest)) = self.pending.take() {
                let payload = rest.split_to(rest.len().min(max_len.max(1)));
                let end_of_message = rest.is_empty();
                if !end_of_message {
                    self.pending = Some((kind, rest));
                }
                return Ok(Fragment::data(kind, payload, end_of_message));
            }

            match self.stream.next().await {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    self.pending = Some((FragmentKind::Text, Bytes::from(text)));
                }
                Some(Ok(TungsteniteMessage::Binary(data))) => {
                    self.pending = Some((FragmentKind::Binary, Bytes::from(data)));
                }
                Some(Ok(TungsteniteMessage::Close(frame))) => {
                    return Ok(Fragment::close(CloseInfo::from_frame(frame)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Ok(Fragment::close(CloseInfo::new(
                        CloseInfo::ABNORMAL,
                        "connection dropped",
                    )));
                }
            }
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(message.into_tungstenite()?).await?;
        Ok(())
    }

    async fn close(&mut self, info: &CloseInfo) -> Result<()> {
        self.stream.close(Some(info.to_frame())).await?;
        Ok(())
    }
}

/// Something that happened on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A complete text or binary message arrived.
    Message(Message),
    /// The session closed. Always the last event.
    Closed(CloseInfo),
}

enum Command {
    Send(Message),
    Close(CloseInfo),
}

/// Cloneable handle for sending on a session.
#[derive(Clone)]
pub struct SessionSender {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SharedState>,
}

impl SessionSender {
    /// The session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Whether the session accepts messages.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Connecting | SessionState::Open)
    }

    /// Queues a message.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.is_open() {
            return Err(Error::InvalidState(format!("session {} is not open", self.id)));
        }
        self.commands
            .send(Command::Send(message))
            .map_err(|_| Error::InvalidState(format!("session {} has ended", self.id)))
    }

    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text))
    }

    /// Queues a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Serializes `value` and queues it as a text message.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send_text(serde_json::to_string(value)?)
    }

    /// Starts the closing handshake.
    pub fn close(&self, info: CloseInfo) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.commands
            .send(Command::Close(info))
            .map_err(|_| Error::InvalidState(format!("session {} has ended", self.id)))
    }
}

/// An open WebSocket session.
pub struct WebSocketSession {
    info: Arc<SessionInfo>,
    sender: SessionSender,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl WebSocketSession {
    /// Starts the receive loop over `transport`.
    ///
    /// When a registry is given, the session is registered while its loop runs.
    pub fn start<T: Transport>(
        transport: T,
        info: SessionInfo,
        config: &WebSocketConfig,
        registry: Option<SessionRegistry>,
    ) -> Self {
        let info = Arc::new(info);
        let state = Arc::new(SharedState::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sender = SessionSender {
            id: info.id().clone(),
            commands: command_tx,
            state: state.clone(),
        };
        if let Some(registry) = &registry {
            registry.add(sender.clone());
        }

        state.set(SessionState::Open);
        info!(session = %info.id(), path = %info.path(), "WebSocket session opened");

        let task = tokio::spawn(receive_loop(
            transport,
            ReceiveLoop {
                info: info.clone(),
                state,
                events: event_tx,
                commands: command_rx,
                buffer_size: config.receive_buffer_size.max(1),
                max_message_size: config.max_message_size,
                registry,
            },
        ));

        Self {
            info,
            sender,
            events: event_rx,
            task,
        }
    }

    /// The session id.
    pub fn id(&self) -> &SessionId {
        self.info.id()
    }

    /// Handshake metadata.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.sender.state()
    }

    /// Whether the session accepts messages.
    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// A cloneable sending handle.
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Queues a message.
    pub fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message)
    }

    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.sender.send_text(text)
    }

    /// Starts the closing handshake.
    pub fn close(&self, info: CloseInfo) -> Result<()> {
        self.sender.close(info)
    }

    /// Waits for the next event. Returns `None` once the loop has ended and every
    /// event has been delivered.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Whether the receive loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct ReceiveLoop {
    info: Arc<SessionInfo>,
    state: Arc<SharedState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    buffer_size: usize,
    max_message_size: usize,
    registry: Option<SessionRegistry>,
}

async fn receive_loop<T: Transport>(mut transport: T, mut ctx: ReceiveLoop) {
    let id = ctx.info.id().clone();
    let mut message = BytesMut::new();
    let mut message_kind: Option<FragmentKind> = None;

    // (close info, whether a close frame still has to be sent)
    let (close, acknowledge) = loop {
        tokio::select! {
            received = transport.receive(ctx.buffer_size) => match received {
                Ok(fragment) if fragment.kind == FragmentKind::Close => {
                    let info = fragment
                        .close
                        .unwrap_or_else(|| CloseInfo::new(CloseInfo::NO_STATUS, ""));
                    break (info, true);
                }
                Ok(fragment) => {
                    let kind = *message_kind.get_or_insert(fragment.kind);
                    message.extend_from_slice(&fragment.payload);
                    if message.len() > ctx.max_message_size {
                        warn!(session = %id, size = message.len(), "WebSocket message exceeds the size limit");
                        break (CloseInfo::new(CloseInfo::TOO_BIG, "message too big"), true);
                    }
                    if fragment.end_of_message {
                        let msg_type = match kind {
                            FragmentKind::Text => MessageType::Text,
                            _ => MessageType::Binary,
                        };
                        let complete = Message::from_parts(msg_type, message.split().freeze());
                        message_kind = None;
                        debug!(session = %id, size = complete.as_bytes().len(), "WebSocket message received");
                        let _ = ctx.events.send(SessionEvent::Message(complete));
                    }
                }
                Err(e) => {
                    warn!(session = %id, error = %e, "WebSocket receive failed");
                    break (CloseInfo::new(CloseInfo::ABNORMAL, e.to_string()), false);
                }
            },
            Some(command) = ctx.commands.recv() => match command {
                Command::Send(outgoing) => {
                    if let Err(e) = transport.send(outgoing).await {
                        warn!(session = %id, error = %e, "WebSocket send failed");
                    }
                }
                Command::Close(info) => {
                    ctx.state.set(SessionState::Closing);
                    if let Err(e) = transport.close(&info).await {
                        warn!(session = %id, error = %e, "WebSocket close failed");
                        break (info, false);
                    }
                }
            },
        }
    };

    ctx.state.set(SessionState::Closing);
    let _ = ctx.events.send(SessionEvent::Closed(close.clone()));
    if acknowledge {
        if let Err(e) = transport.close(&close).await {
            debug!(session = %id, error = %e, "Close acknowledgement not sent");
        }
    }
    ctx.state.set(SessionState::Closed);

    if let Some(registry) = &ctx.registry {
        registry.remove(&id);
    }
    info!(session = %id, code = close.code, reason = %close.reason, "WebSocket session closed");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport fed from a script; waits forever once the script runs out.
    pub(crate) struct ScriptedTransport {
        incoming: VecDeque<Result<Fragment>>,
        pub(crate) sent: Arc<Mutex<Vec<Message>>>,
        pub(crate) closes: Arc<Mutex<Vec<CloseInfo>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(incoming: Vec<Result<Fragment>>) -> Self {
            Self {
                incoming: incoming.into(),
                sent: Arc::default(),
                closes: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn receive(&mut self, max_len: usize) -> Result<Fragment> {
            match self.incoming.pop_front() {
                Some(Ok(fragment)) => {
                    assert!(fragment.payload.len() <= max_len);
                    Ok(fragment)
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn send(&mut self, message: Message) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }

        async fn close(&mut self, info: &CloseInfo) -> Result<()> {
            self.closes.lock().push(info.clone());
            Ok(())
        }
    }

    fn info() -> SessionInfo {
        SessionInfo::new("/ws".to_string(), HeaderMap::new(), None, None)
    }

    async fn drain(session: &mut WebSocketSession) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_fragments_reassemble_into_one_message() {
        let transport = ScriptedTransport::new(vec![
            Ok(Fragment::data(FragmentKind::Text, "hel", false)),
            Ok(Fragment::data(FragmentKind::Text, "lo ", false)),
            Ok(Fragment::data(FragmentKind::Text, "world", true)),
            Ok(Fragment::close(CloseInfo::normal())),
        ]);
        let closes = transport.closes.clone();
        let mut session =
            WebSocketSession::start(transport, info(), &WebSocketConfig::default(), None);

        let events = drain(&mut session).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            SessionEvent::Message(msg) => {
                assert!(msg.is_text());
                assert_eq!(msg.as_text(), Some("hello world"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events[1], SessionEvent::Closed(CloseInfo::normal()));
        assert_eq!(closes.lock().len(), 1);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_binary_and_text_messages_in_order() {
        let transport = ScriptedTransport::new(vec![
            Ok(Fragment::data(FragmentKind::Binary, vec![1u8, 2], true)),
            Ok(Fragment::data(FragmentKind::Text, "next", true)),
            Ok(Fragment::close(CloseInfo::new(CloseInfo::GOING_AWAY, "bye"))),
        ]);
        let mut session =
            WebSocketSession::start(transport, info(), &WebSocketConfig::default(), None);

        let events = drain(&mut session).await;
        assert_eq!(
            events,
            vec![
                SessionEvent::Message(Message::binary(vec![1u8, 2])),
                SessionEvent::Message(Message::text("next")),
                SessionEvent::Closed(CloseInfo::new(CloseInfo::GOING_AWAY, "bye")),
            ]
        );
    }

    #[tokio::test]
    async fn test_outgoing_messages_are_written() {
        let transport = ScriptedTransport::new(Vec::new());
        let sent = transport.sent.clone();
        let closes = transport.closes.clone();
        let session = WebSocketSession::start(transport, info(), &WebSocketConfig::default(), None);

        session.send_text("one").unwrap();
        session.sender().send_binary(vec![9u8]).unwrap();
        session.close(CloseInfo::normal()).unwrap();

        for _ in 0..100 {
            if !closes.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *sent.lock(),
            vec![Message::text("one"), Message::binary(vec![9u8])]
        );
        assert_eq!(*closes.lock(), vec![CloseInfo::normal()]);
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.send_text("late").is_err());
    }

    #[tokio::test]
    async fn test_oversized_message_closes_session() {
        let transport = ScriptedTransport::new(vec![
            Ok(Fragment::data(FragmentKind::Binary, vec![0u8; 8], false)),
            Ok(Fragment::data(FragmentKind::Binary, vec![0u8; 8], true)),
        ]);
        let config = WebSocketConfig::default().with_max_message_size(10);
        let mut session = WebSocketSession::start(transport, info(), &config, None);

        let events = drain(&mut session).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::Closed(close) if close.code == CloseInfo::TOO_BIG
        ));
    }

    #[tokio::test]
    async fn test_transport_error_ends_loop() {
        let transport = ScriptedTransport::new(vec![Err(Error::custom("reset"))]);
        let closes = transport.closes.clone();
        let mut session =
            WebSocketSession::start(transport, info(), &WebSocketConfig::default(), None);

        let events = drain(&mut session).await;
        assert!(matches!(
            &events[..],
            [SessionEvent::Closed(close)] if close.code == CloseInfo::ABNORMAL
        ));
        assert!(closes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_registry_tracks_session_lifetime() {
        let registry = SessionRegistry::new();
        let transport = ScriptedTransport::new(vec![Ok(Fragment::close(CloseInfo::normal()))]);
        let mut session = WebSocketSession::start(
            transport,
            info(),
            &WebSocketConfig::default(),
            Some(registry.clone()),
        );
        let id = session.id().clone();

        drain(&mut session).await;
        assert!(registry.get(&id).is_none());
        assert_eq!(registry.count(), 0);
    }
}
