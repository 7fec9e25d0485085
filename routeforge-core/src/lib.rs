//! # RouteForge Core - HTTP Routing, Dispatch and WebSocket Sessions
//!
//! `routeforge-core` is the engine behind RouteForge. It matches HTTP requests
//! against registered path templates, binds typed route parameters to handler
//! arguments, serves connections from a dedicated accept thread and turns upgraded
//! connections into WebSocket sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Application                          │
//! │   ┌────────────┐   ┌──────────┐   ┌──────────────────────┐  │
//! │   │  Handlers  │   │  Router  │   │ State & Controllers  │  │
//! │   └────────────┘   └──────────┘   └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RouteForge Core                        │
//! │  ┌──────────┐  ┌───────────┐  ┌─────────┐  ┌─────────────┐  │
//! │  │  Server  │  │ Templates │  │ Invoker │  │  WebSocket  │  │
//! │  │  & codec │  │ & params  │  │         │  │  sessions   │  │
//! │  └──────────┘  └───────────┘  └─────────┘  └─────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 tokio / tokio-tungstenite                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`template`]: route templates, parameter extraction and type inference
//! - [`router`]: registration and dispatch
//! - [`handler`]: the `Handler` trait, argument binding and return values
//! - [`extractor`]: typed handler arguments
//! - [`server`]: accept loop, connection tasks and lifecycle
//! - [`websocket`]: upgrades, sessions and the session registry
//! - [`codec`]: HTTP/1.1 request parsing and response encoding
//! - [`config`]: server and WebSocket settings
//! - [`error`]: error type and result alias
//!
//! ## Quick Start
//!
//! ```no_run
//! use routeforge_core::prelude::*;
//!
//! async fn get_order(Param(id): Param<u64>) -> String {
//!     format!("order {}", id)
//! }
//!
//! async fn echo(upgrade: WebSocketUpgrade) -> Result<()> {
//!     upgrade.on_upgrade(|mut session| async move {
//!         while let Some(event) = session.next_event().await {
//!             if let SessionEvent::Message(message) = event {
//!                 let _ = session.send(message);
//!             }
//!         }
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     Router::new()
//!         .get("/orders/{id}", handler(get_order))
//!         .get("/ws", handler(echo))
//!         .listen("http://127.0.0.1:8080/")
//!         .await
//! }
//! ```
//!
//! ## Route Templates
//!
//! Parameter segments are written `{name}` or `:name:`; both forms may be mixed in
//! one template. Exact paths always win over templates, and templates are tried in
//! the order they were registered.
//!
//! ## Handler Arguments
//!
//! Arguments are bound positionally. Each [`Param<T>`](extractor::Param) consumes
//! the next route parameter; other extractors ([`HttpContext`], [`State<T>`],
//! [`Json<T>`], [`Query`], [`WebSocketUpgrade`], …) do not. A handler that takes
//! route parameters must take exactly as many as the route provides.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod codec;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod extractor;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;
pub mod template;
pub mod verb;
pub mod websocket;

pub use config::{ServerConfig, WebSocketConfig};
pub use context::HttpContext;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use extractor::{Body, FromRequest, FromRouteParam, Json, Param, Params, Query, State};
pub use handler::{Handler, HandlerService, IntoHandler, IntoResponse, JsonResponse, handler};
pub use request::Request;
pub use response::Response;
pub use router::{Route, Router};
pub use server::{Acceptor, Server, ServerState, TcpAcceptor};
pub use state::{AppState, Controller, ControllerCache};
pub use template::{ParamKind, ParamValue, RouteParameter, RouteTemplate};
pub use verb::Verb;
pub use websocket::{
    CloseInfo, Message, MessageType, SessionEvent, SessionRegistry, WebSocketSession,
    WebSocketUpgrade,
};

/// Commonly used types and traits.
///
/// ```
/// use routeforge_core::prelude::*;
///
/// async fn health() -> StatusCode {
///     StatusCode::NO_CONTENT
/// }
///
/// let router = Router::new().get("/health", handler(health));
/// ```
pub mod prelude {
    pub use crate::config::{ServerConfig, WebSocketConfig};
    pub use crate::context::HttpContext;
    pub use crate::error::{Error, Result};
    pub use crate::extractor::{Body, Json, Param, Params, Query, State};
    pub use crate::handler::{Handler, IntoResponse, JsonResponse, handler};
    pub use crate::request::Request;
    pub use crate::response::Response;
    pub use crate::router::Router;
    pub use crate::server::{Server, ServerState};
    pub use crate::state::{AppState, Controller};
    pub use crate::template::{ParamKind, ParamValue, RouteParameter};
    pub use crate::verb::Verb;
    pub use crate::websocket::{
        CloseInfo, Message, MessageType, SessionEvent, SessionSender, WebSocketSession,
        WebSocketUpgrade,
    };
    pub use http::StatusCode;
}
