//! The HTTP side of a WebSocket upgrade.
//!
//! ```text
//! handler                       server                           session task
//!    │ WebSocketUpgrade              │                                  │
//!    │ into_pending / on_upgrade ───►│ 101 written                      │
//!    │                               │ raw connection ── oneshot ──────►│ accept()
//!    │                               │                                  │ receive loop
//! ```
//!
//! The upgrade validates the handshake headers while extracting, so a request that
//! is not a WebSocket handshake fails before the handler runs. Accepting waits for
//! the server to hand over the connection; if that does not happen within
//! `upgrade_timeout_ms` the upgrade fails with [`Error::UpgradeTimeout`].

use std::future::Future;

use async_trait::async_trait;
use base64::Engine;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::HeaderValue;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig as ProtocolConfig};
use tracing::{debug, error};

use crate::config::WebSocketConfig;
use crate::context::HttpContext;
use crate::error::{Error, Result};
use crate::extractor::{FromRequest, ParamCursor};
use crate::request::Request;
use crate::websocket::registry::SessionRegistry;
use crate::websocket::session::{SessionInfo, TungsteniteTransport, WebSocketSession};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A byte stream a WebSocket session can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

/// A connection released by the server after a `101` response.
pub struct Upgraded {
    pub(crate) io: Box<dyn Io>,
    pub(crate) read_buf: Vec<u8>,
}

impl Upgraded {
    pub(crate) fn new(io: Box<dyn Io>, read_buf: Vec<u8>) -> Self {
        Self { io, read_buf }
    }
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Checks the handshake headers and returns the accept key.
pub fn validate_handshake(request: &Request) -> Result<String> {
    if !request.is_websocket_upgrade() {
        return Err(Error::Upgrade(
            "missing Connection: Upgrade or Upgrade: websocket header".to_string(),
        ));
    }
    let key = request
        .header("sec-websocket-key")
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| Error::Upgrade("missing Sec-WebSocket-Key header".to_string()))?;
    if request.header("sec-websocket-version").map(str::trim) != Some("13") {
        return Err(Error::Upgrade(
            "missing or unsupported Sec-WebSocket-Version (must be 13)".to_string(),
        ));
    }
    Ok(compute_accept_key(key.trim()))
}

fn requested_protocols(request: &Request) -> Vec<String> {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// A validated WebSocket handshake waiting to be accepted.
///
/// ```
/// use routeforge_core::prelude::*;
///
/// async fn echo(upgrade: WebSocketUpgrade) -> Result<()> {
///     upgrade.on_upgrade(|mut session| async move {
///         while let Some(event) = session.next_event().await {
///             if let SessionEvent::Message(message) = event {
///                 let _ = session.send(message);
///             }
///         }
///     })
/// }
///
/// let router = Router::new().get("/ws", handler(echo));
/// ```
pub struct WebSocketUpgrade {
    ctx: HttpContext,
    accept_key: String,
    requested: Vec<String>,
    protocol: Option<String>,
}

impl WebSocketUpgrade {
    /// Validates the handshake carried by the context's request.
    pub fn from_context(ctx: &HttpContext) -> Result<Self> {
        let accept_key = validate_handshake(ctx.request())?;
        Ok(Self {
            ctx: ctx.clone(),
            accept_key,
            requested: requested_protocols(ctx.request()),
            protocol: None,
        })
    }

    /// Subprotocols the client offered, in preference order.
    pub fn requested_protocols(&self) -> &[String] {
        &self.requested
    }

    /// Selects the first offered subprotocol that appears in `supported`.
    pub fn protocols(mut self, supported: &[&str]) -> Self {
        self.protocol = self
            .requested
            .iter()
            .find(|p| supported.iter().any(|s| s.eq_ignore_ascii_case(p)))
            .cloned();
        self
    }

    /// The selected subprotocol.
    pub fn selected_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Ends the response with `101 Switching Protocols` and returns the upgrade to
    /// accept once the handler has returned.
    pub fn into_pending(self) -> Result<PendingUpgrade> {
        let mut headers = vec![
            (UPGRADE, HeaderValue::from_static("websocket")),
            (CONNECTION, HeaderValue::from_static("Upgrade")),
            (
                SEC_WEBSOCKET_ACCEPT,
                HeaderValue::from_str(&self.accept_key)
                    .map_err(|e| Error::Upgrade(e.to_string()))?,
            ),
        ];
        if let Some(protocol) = &self.protocol {
            let value =
                HeaderValue::from_str(protocol).map_err(|e| Error::Upgrade(e.to_string()))?;
            headers.push((SEC_WEBSOCKET_PROTOCOL, value));
        }

        let rx = self.ctx.response().switch_protocols(headers)?;
        let request = self.ctx.request();
        let info = SessionInfo::new(
            request.path().to_string(),
            request.headers().clone(),
            request.remote_addr(),
            self.protocol.clone(),
        );
        debug!(session = %info.id(), path = %info.path(), "WebSocket upgrade accepted");

        Ok(PendingUpgrade {
            rx,
            info,
            config: self.ctx.websocket_config().clone(),
            registry: self.ctx.sessions().clone(),
        })
    }

    /// Accepts the upgrade in a background task and runs `callback` with the
    /// session. Upgrade failures are logged.
    pub fn on_upgrade<F, Fut>(self, callback: F) -> Result<()>
    where
        F: FnOnce(WebSocketSession) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pending = self.into_pending()?;
        tokio::spawn(async move {
            match pending.accept().await {
                Ok(session) => callback(session).await,
                Err(e) => error!(error = %e, "WebSocket upgrade failed"),
            }
        });
        Ok(())
    }
}

#[async_trait]
impl FromRequest for WebSocketUpgrade {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        WebSocketUpgrade::from_context(ctx)
    }
}

/// An upgrade whose `101` response has been prepared.
pub struct PendingUpgrade {
    rx: oneshot::Receiver<Upgraded>,
    info: SessionInfo,
    config: WebSocketConfig,
    registry: SessionRegistry,
}

impl PendingUpgrade {
    /// Waits for the connection and starts the session's receive loop.
    ///
    /// Fails with [`Error::UpgradeTimeout`] when the connection is not handed over
    /// within the configured timeout, and with [`Error::Upgrade`] when the server
    /// dropped it.
    pub async fn accept(self) -> Result<WebSocketSession> {
        let PendingUpgrade {
            rx,
            info,
            config,
            registry,
        } = self;

        let mut protocol = ProtocolConfig::default();
        protocol.max_message_size = Some(config.max_message_size);

        let handshake = async move {
            let upgraded = rx.await.map_err(|_| {
                Error::Upgrade("connection closed before the upgrade completed".to_string())
            })?;
            let stream = WebSocketStream::from_partially_read(
                upgraded.io,
                upgraded.read_buf,
                Role::Server,
                Some(protocol),
            )
            .await;
            Ok::<_, Error>(stream)
        };

        let stream = match tokio::time::timeout(config.upgrade_timeout(), handshake).await {
            Ok(stream) => stream?,
            Err(_) => {
                error!(
                    session = %info.id(),
                    timeout_ms = config.upgrade_timeout_ms,
                    "WebSocket upgrade timed out"
                );
                return Err(Error::UpgradeTimeout(config.upgrade_timeout_ms));
            }
        };

        Ok(WebSocketSession::start(
            TungsteniteTransport::new(stream),
            info,
            &config,
            Some(registry),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use http::StatusCode;
    use std::time::Duration;

    fn handshake_request() -> Request {
        Request::builder()
            .target("/chat")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Protocol", "chat, superchat")
            .build()
            .unwrap()
    }

    #[test]
    fn test_compute_accept_key() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_validate_rejects_plain_requests() {
        let plain = Request::builder().target("/chat").build().unwrap();
        assert!(matches!(validate_handshake(&plain), Err(Error::Upgrade(_))));

        let wrong_version = Request::builder()
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Key", "abc")
            .header("Sec-WebSocket-Version", "8")
            .build()
            .unwrap();
        assert!(validate_handshake(&wrong_version).is_err());
    }

    #[test]
    fn test_into_pending_sets_switching_protocols() {
        let ctx = HttpContext::new(handshake_request(), Response::new());
        let response = ctx.response().clone();

        let upgrade = WebSocketUpgrade::from_context(&ctx)
            .unwrap()
            .protocols(&["superchat"]);
        assert_eq!(upgrade.requested_protocols(), &["chat", "superchat"]);
        assert_eq!(upgrade.selected_protocol(), Some("superchat"));
        let _pending = upgrade.into_pending().unwrap();

        assert!(response.is_ended());
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.header("sec-websocket-accept").as_deref(),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(
            response.header("sec-websocket-protocol").as_deref(),
            Some("superchat")
        );
        assert!(response.take_upgrade().is_some());
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let ctx = HttpContext::new(handshake_request(), Response::new());
        let response = ctx.response().clone();
        let mut pending = WebSocketUpgrade::from_context(&ctx)
            .unwrap()
            .into_pending()
            .unwrap();
        pending.config = pending
            .config
            .clone()
            .with_upgrade_timeout(Duration::from_millis(20));

        // keep the sender alive without ever handing over a connection
        let _sender = response.take_upgrade().unwrap();
        let err = pending.accept().await.err().unwrap();
        assert!(matches!(err, Error::UpgradeTimeout(20)));
    }

    #[tokio::test]
    async fn test_accept_fails_when_connection_dropped() {
        let ctx = HttpContext::new(handshake_request(), Response::new());
        let response = ctx.response().clone();
        let pending = WebSocketUpgrade::from_context(&ctx)
            .unwrap()
            .into_pending()
            .unwrap();

        drop(response.take_upgrade());
        let err = pending.accept().await.err().unwrap();
        assert!(matches!(err, Error::Upgrade(_)));
    }
}
