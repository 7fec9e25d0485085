//! Incoming HTTP requests.
//!
//! A [`Request`] is built by the connection server for every request read from a
//! socket, handed to [`Router::process`](crate::router::Router::process) and then
//! shared read-only with every handler invoked for it. The router fills in the
//! matched route and its extracted [`RouteParameter`]s before any handler runs.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::template::RouteParameter;
use crate::verb::Verb;

/// A parsed HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    verb: Verb,
    target: String,
    path: String,
    query: Option<String>,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    route: Option<String>,
    params: Vec<RouteParameter>,
}

impl Request {
    /// Starts building a request, mostly useful in tests.
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    pub(crate) fn from_parts(
        method: Method,
        target: String,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Self> {
        let verb = Verb::try_from(&method)?;
        let (path, query) = split_target(&target);
        Ok(Self {
            method,
            verb,
            target,
            path,
            query,
            version,
            headers,
            body,
            remote_addr: None,
            route: None,
            params: Vec::new(),
        })
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request method as a routing verb.
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// The request target exactly as sent on the request line.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The path part of the target, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Decoded `name=value` pairs from the query string, in order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = self.query.as_deref() else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_query_component(name), decode_query_component(value))
            })
            .collect()
    }

    /// HTTP version of the request line.
    pub fn version(&self) -> Version {
        self.version
    }

    /// All request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    ///
    /// A body that does not deserialize is a client error ([`Error::Parse`]).
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::parse(format!("invalid JSON body: {}", e)))
    }

    /// Address of the peer, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    /// The registered path this request was routed to.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Route parameters in template order.
    pub fn params(&self) -> &[RouteParameter] {
        &self.params
    }

    /// A route parameter by name.
    pub fn param(&self, name: &str) -> Option<&RouteParameter> {
        self.params.iter().find(|p| p.name() == name)
    }

    pub(crate) fn set_route(&mut self, route: String, params: Vec<RouteParameter>) {
        self.route = Some(route);
        self.params = params;
    }

    /// Whether the connection should stay open after the response.
    pub fn keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers
                .get_all(http::header::CONNECTION)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        match self.version {
            Version::HTTP_10 => has_token("keep-alive"),
            _ => !has_token("close"),
        }
    }

    /// Whether the request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        let connection_upgrade = self
            .headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("upgrade"));
        let upgrade_websocket = self
            .header(http::header::UPGRADE.as_str())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        connection_upgrade && upgrade_websocket
    }
}

fn decode_query_component(component: &str) -> String {
    let spaced = component.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

fn split_target(target: &str) -> (String, Option<String>) {
    // absolute-form: http://host:port/path?query
    let origin = match target.find("://") {
        Some(scheme_end) => {
            let rest = &target[scheme_end + 3..];
            match rest.find('/') {
                Some(path_start) => &rest[path_start..],
                None => "/",
            }
        }
        None => target,
    };
    match origin.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (origin.to_string(), None),
    }
}

/// Builder for [`Request`] values.
pub struct RequestBuilder {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    /// A `GET /` request.
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            target: "/".to_string(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    /// Sets the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the request target (path and optional query).
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Sets the HTTP version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header. Invalid names or values are reported by [`build`](Self::build).
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the peer address.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Builds the request.
    pub fn build(self) -> Result<Request> {
        let mut request =
            Request::from_parts(self.method, self.target, self.version, self.headers, self.body)?;
        request.set_remote_addr(self.remote_addr);
        Ok(request)
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<RequestBuilder> for Request {
    type Error = Error;

    fn try_from(builder: RequestBuilder) -> Result<Self> {
        builder.build()
    }
}
