//! Listen endpoints (`scheme://host:port/`).

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A parsed listen endpoint.
///
/// The scheme defaults to `http` and the path always ends with `/`. The wildcard
/// hosts `*` and `+` bind every interface.
///
/// Only the host and port are used for binding. The path is kept for display and
/// does not filter requests: routes match the full request path on every endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Parses an endpoint string.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidEndpoint(input.to_string());
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("http".to_string(), trimmed),
        };
        let default_port = match scheme.as_str() {
            "http" | "ws" => 80,
            // TLS termination is not handled by this server
            _ => return Err(invalid()),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, after) = stripped.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => default_port,
                None => return Err(invalid()),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().map_err(|_| invalid())?),
                None => (authority.to_string(), default_port),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let mut path = path.to_string();
        if !path.ends_with('/') {
            path.push('/');
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// The scheme, lower-cased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host as written.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The path prefix, always ending with `/`. Informational only.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the endpoint binds every interface.
    pub fn is_wildcard(&self) -> bool {
        self.host == "*" || self.host == "+"
    }

    /// Host and port in a form `tokio::net::TcpListener::bind` accepts.
    pub fn bind_address(&self) -> String {
        if self.is_wildcard() {
            format!("0.0.0.0:{}", self.port)
        } else if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}{}", self.scheme, self.host, self.port, self.path)
        } else {
            write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }
}
