//! HTTP verbs used for route registration.
//!
//! [`Verb::Any`] is a registration-only wildcard: a handler registered with it fires
//! for every request method.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The verb a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Matches every request method.
    Any,
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
    /// CONNECT
    Connect,
    /// TRACE
    Trace,
}

impl Verb {
    /// Whether a handler registered with `self` fires for a request made with `request`.
    pub fn matches(self, request: Verb) -> bool {
        self == Verb::Any || self == request
    }

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Any => "ANY",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
            Verb::Head => "HEAD",
            Verb::Options => "OPTIONS",
            Verb::Connect => "CONNECT",
            Verb::Trace => "TRACE",
        }
    }
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" | "*" => Ok(Verb::Any),
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            "HEAD" => Ok(Verb::Head),
            "OPTIONS" => Ok(Verb::Options),
            "CONNECT" => Ok(Verb::Connect),
            "TRACE" => Ok(Verb::Trace),
            other => Err(Error::parse(format!("unknown method '{}'", other))),
        }
    }
}

impl TryFrom<&http::Method> for Verb {
    type Error = Error;

    /// Wire methods are case-sensitive, and `ANY` is never a request method.
    fn try_from(method: &http::Method) -> Result<Self> {
        match method.as_str() {
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            "HEAD" => Ok(Verb::Head),
            "OPTIONS" => Ok(Verb::Options),
            "CONNECT" => Ok(Verb::Connect),
            "TRACE" => Ok(Verb::Trace),
            other => Err(Error::parse(format!("unsupported method '{}'", other))),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
