//! The per-invocation handler context.

use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;

use crate::config::WebSocketConfig;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;
use crate::state::{AppState, ControllerCache};
use crate::template::RouteParameter;
use crate::websocket::SessionRegistry;

/// Everything a handler can reach while serving one request.
///
/// A context is built by the router for each request and cloned into every handler
/// invoked for it. It is passed as an argument rather than attached to any shared
/// object, so two requests never see each other's request or response.
#[derive(Clone)]
pub struct HttpContext {
    request: Arc<Request>,
    response: Response,
    state: AppState,
    controllers: ControllerCache,
    sessions: SessionRegistry,
    websocket: Arc<WebSocketConfig>,
}

impl HttpContext {
    /// A context with empty state, useful for invoking handlers directly.
    pub fn new(request: Request, response: Response) -> Self {
        Self {
            request: Arc::new(request),
            response,
            state: AppState::new(),
            controllers: ControllerCache::new(),
            sessions: SessionRegistry::new(),
            websocket: Arc::new(WebSocketConfig::default()),
        }
    }

    pub(crate) fn from_parts(
        request: Arc<Request>,
        response: Response,
        state: AppState,
        controllers: ControllerCache,
        sessions: SessionRegistry,
        websocket: Arc<WebSocketConfig>,
    ) -> Self {
        Self {
            request,
            response,
            state,
            controllers,
            sessions,
            websocket,
        }
    }

    /// Replaces the application state.
    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = state;
        self
    }

    /// The request being served.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response handle shared by all handlers of this request.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Route parameters in template order.
    pub fn params(&self) -> &[RouteParameter] {
        self.request.params()
    }

    /// A route parameter by name.
    pub fn param(&self, name: &str) -> Option<&RouteParameter> {
        self.request.param(name)
    }

    /// Application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Controller instances.
    pub fn controllers(&self) -> &ControllerCache {
        &self.controllers
    }

    /// Open WebSocket sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// WebSocket settings applied to upgrades from this request.
    pub fn websocket_config(&self) -> &WebSocketConfig {
        &self.websocket
    }

    /// Ends the response with a plain-text body and the given status.
    pub fn text(&self, status: StatusCode, body: impl AsRef<str>) -> Result<()> {
        self.response
            .send(status, "text/plain; charset=utf-8", body.as_ref())
    }

    /// Ends the response with a JSON body and the given status.
    pub fn json<T: Serialize>(&self, status: StatusCode, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.response.send(status, "application/json", body)
    }
}
