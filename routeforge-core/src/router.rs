//! Route registration and request dispatch.
//!
//! The router maps paths to ordered lists of `(verb, handler)` pairs. Static paths
//! are looked up exactly; templated paths (containing `{name}` or `:name:`
//! segments) are additionally compiled into anchored patterns that are tried in
//! registration order when no exact entry exists.
//!
//! # Dispatch
//!
//! For each request the router:
//!
//! 1. ignores requests with an empty path,
//! 2. looks the path up exactly, and otherwise takes the first template whose
//!    pattern matches, extracting its parameters,
//! 3. answers `404` when nothing matched,
//! 4. invokes every handler of the resolved path whose verb is `ANY` or the
//!    request's verb, in registration order, and answers `404` when none did.
//!
//! A handler whose route parameter fails to convert is answered with `400` and the
//! remaining handlers still run. Any other handler error stops dispatch and is
//! returned to the caller.
//!
//! Two templates that match the same path are resolved by registration order
//! alone; there is no specificity ranking.
//!
//! # Examples
//!
//! ```
//! use routeforge_core::prelude::*;
//!
//! async fn list_users() -> &'static str {
//!     "all users"
//! }
//!
//! async fn get_user(Param(id): Param<u64>) -> String {
//!     format!("user {}", id)
//! }
//!
//! async fn audit(ctx: HttpContext) {
//!     tracing::info!("{} {}", ctx.request().verb(), ctx.request().path());
//! }
//!
//! let router = Router::new()
//!     .get("/users", handler(list_users))
//!     .get("/users/{id}", handler(get_user))
//!     .all("/users/{id}", handler(audit));
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use http::StatusCode;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::config::{ServerConfig, WebSocketConfig};
use crate::context::HttpContext;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::request::Request;
use crate::response::Response;
use crate::server::Server;
use crate::state::{AppState, Controller, ControllerCache};
use crate::template::{RouteParameter, RouteTemplate, is_templated, template_regex};
use crate::verb::Verb;
use crate::websocket::SessionRegistry;

/// A handler registered for a verb.
#[derive(Clone)]
pub struct Route {
    /// The verb the handler fires for.
    pub verb: Verb,
    /// The handler.
    pub handler: Arc<dyn Handler>,
}

struct TemplateRoute {
    pattern: Regex,
    path: String,
}

/// Registry of handlers and the dispatcher that runs them.
#[derive(Clone)]
pub struct Router {
    routes: Arc<DashMap<String, Vec<Route>>>,
    templates: Arc<RwLock<Vec<TemplateRoute>>>,
    state: AppState,
    controllers: ControllerCache,
    sessions: SessionRegistry,
    websocket: Arc<WebSocketConfig>,
}

/// Ensures a leading slash and drops trailing ones, except for the root path.
pub(crate) fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            templates: Arc::new(RwLock::new(Vec::new())),
            state: AppState::new(),
            controllers: ControllerCache::new(),
            sessions: SessionRegistry::new(),
            websocket: Arc::new(WebSocketConfig::default()),
        }
    }

    /// Registers `handler` for `path` and `verb`.
    pub fn add(&self, path: impl AsRef<str>, verb: Verb, handler: Arc<dyn Handler>) {
        let path = normalize_path(path.as_ref());

        if is_templated(&path) {
            let mut templates = self.templates.write();
            if !templates.iter().any(|t| t.path == path) {
                match template_regex(&path) {
                    Ok(pattern) => templates.push(TemplateRoute {
                        pattern,
                        path: path.clone(),
                    }),
                    Err(e) => error!(path = %path, error = %e, "Cannot compile route template"),
                }
            }
        }

        debug!("Registered {} {}", verb, path);
        self.routes
            .entry(path)
            .or_default()
            .push(Route { verb, handler });
    }

    /// Registers a handler and returns the router.
    pub fn route(self, path: impl AsRef<str>, verb: Verb, handler: Arc<dyn Handler>) -> Self {
        self.add(path, verb, handler);
        self
    }

    /// Registers a `GET` handler.
    pub fn get(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Get, handler)
    }

    /// Registers a `POST` handler.
    pub fn post(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Post, handler)
    }

    /// Registers a `PUT` handler.
    pub fn put(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Put, handler)
    }

    /// Registers a `PATCH` handler.
    pub fn patch(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Patch, handler)
    }

    /// Registers a `DELETE` handler.
    pub fn delete(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Delete, handler)
    }

    /// Registers a `HEAD` handler.
    pub fn head(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Head, handler)
    }

    /// Registers an `OPTIONS` handler.
    pub fn options(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Options, handler)
    }

    /// Registers a `TRACE` handler.
    pub fn trace(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Trace, handler)
    }

    /// Registers a `CONNECT` handler.
    pub fn connect(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Connect, handler)
    }

    /// Registers a handler for every verb.
    pub fn all(self, path: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.route(path, Verb::Any, handler)
    }

    /// Removes handlers from `path`.
    ///
    /// With neither `handler` nor `verb` every handler at the path is removed.
    /// Otherwise only entries matching the given handler (by identity) and verb
    /// are. Returns the number of handlers removed.
    pub fn remove(
        &self,
        path: impl AsRef<str>,
        handler: Option<&Arc<dyn Handler>>,
        verb: Option<Verb>,
    ) -> usize {
        let path = normalize_path(path.as_ref());

        let (removed, now_empty) = match self.routes.get_mut(&path) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|route| {
                    let same_handler = handler.is_none_or(|h| Arc::ptr_eq(h, &route.handler));
                    let same_verb = verb.is_none_or(|v| v == route.verb);
                    !(same_handler && same_verb)
                });
                (before - entry.len(), entry.is_empty())
            }
            None => (0, false),
        };

        if now_empty {
            self.routes.remove(&path);
            self.templates.write().retain(|t| t.path != path);
        }
        if removed > 0 {
            debug!("Removed {} handler(s) from {}", removed, path);
        }
        removed
    }

    /// Adds shared application state.
    pub fn with_state<T: Send + Sync + 'static>(self, data: Arc<T>) -> Self {
        self.state.insert(data);
        self
    }

    /// Registers a pre-built controller instance.
    pub fn controller<C: Controller>(self, instance: Arc<C>) -> Self {
        self.controllers.insert(instance);
        self
    }

    /// Sets the WebSocket settings used by upgrades.
    pub fn with_websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.websocket = Arc::new(config);
        self
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

    /// Registered paths.
    pub fn paths(&self) -> Vec<String> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handlers registered at `path`, in registration order.
    pub fn handlers(&self, path: impl AsRef<str>) -> Vec<Route> {
        self.routes
            .get(&normalize_path(path.as_ref()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Finds the registered path serving `path` and extracts its parameters.
    pub fn resolve(&self, path: &str) -> Option<(String, Vec<RouteParameter>)> {
        let path = normalize_path(path);
        if path.is_empty() {
            return None;
        }

        let exact = self
            .routes
            .get(&path)
            .map(|entry| !entry.is_empty())
            .unwrap_or(false);
        if exact {
            return Some((path, Vec::new()));
        }

        let templates = self.templates.read();
        templates
            .iter()
            .find(|t| t.pattern.is_match(&path))
            .map(|t| {
                let params = RouteTemplate::new(t.path.as_str(), path.as_str()).into_parameters();
                (t.path.clone(), params)
            })
    }

    /// Dispatches a request to every matching handler.
    pub async fn process(&self, mut request: Request, response: &Response) -> Result<()> {
        if request.path().is_empty() {
            return Ok(());
        }

        let Some((route, params)) = self.resolve(request.path()) else {
            return not_found(&request, response);
        };

        // cloned out so no map shard stays locked across handler awaits
        let routes = self.handlers(&route);
        let verb = request.verb();
        request.set_route(route, params);

        let ctx = HttpContext::from_parts(
            Arc::new(request),
            response.clone(),
            self.state.clone(),
            self.controllers.clone(),
            self.sessions.clone(),
            self.websocket.clone(),
        );

        let mut fired = 0;
        for route in routes.iter().filter(|r| r.verb.matches(verb)) {
            fired += 1;
            match route.handler.call(ctx.clone()).await {
                Ok(()) => {}
                Err(Error::ParameterCoercion { name, .. }) => {
                    debug!(parameter = %name, "Answering 400 for an unbindable route parameter");
                    if !response.is_ended() {
                        response.send(
                            StatusCode::BAD_REQUEST,
                            "text/plain; charset=utf-8",
                            format!("400 Bad Request: invalid value for route parameter '{}'", name),
                        )?;
                    }
                }
                Err(Error::ResponseEnded) => {
                    warn!(
                        path = %ctx.request().path(),
                        "Handler wrote to a response that had already ended"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if fired == 0 {
            return not_found(ctx.request(), response);
        }
        Ok(())
    }

    /// Serves this router on `endpoint` with default settings until the server
    /// stops.
    pub async fn listen(self, endpoint: impl AsRef<str>) -> Result<()> {
        let config = ServerConfig::default().with_prefix(endpoint.as_ref());
        let server = Server::new(self, config)?;
        server.start().await?;
        server.join().await;
        Ok(())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(request: &Request, response: &Response) -> Result<()> {
    let miss = Error::RouteNotFound(format!("{} {}", request.verb(), request.path()));
    warn!("{}", miss);
    if response.is_ended() {
        return Ok(());
    }
    response.send(
        miss.status_code(),
        "text/plain; charset=utf-8",
        "404 Not Found",
    )
}
