//! Error types and result handling for RouteForge.
//!
//! Every fallible operation in the engine returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. The variants follow the failure taxonomy of the
//! dispatch pipeline:
//!
//! | Failure | Variant | Answered with |
//! |---------|---------|---------------|
//! | no path or verb match | [`Error::RouteNotFound`] | 404 |
//! | malformed request or JSON body | [`Error::Parse`] | 400 |
//! | route/method parameter count differs | [`Error::ParameterArity`] | 500 |
//! | route parameter cannot bind to the declared type | [`Error::ParameterCoercion`] | 400 |
//! | handler failure | [`Error::Handler`], [`Error::Io`], ... | 500 |
//! | WebSocket handshake not completed in time | [`Error::UpgradeTimeout`] | raised to the caller |
//!
//! # Examples
//!
//! ```
//! use routeforge_core::prelude::*;
//!
//! async fn show(Param(id): Param<i64>) -> Result<String> {
//!     if id < 0 {
//!         return Err(Error::handler("negative ids are not allowed"));
//!     }
//!     Ok(format!("item {}", id))
//! }
//! ```

use http::StatusCode;
use std::fmt;
use thiserror::Error;

/// The main error type for RouteForge.
#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket protocol error from the underlying tungstenite stream.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error on a socket or file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The request could not be parsed as HTTP/1.1.
    #[error("Malformed request: {0}")]
    Parse(String),

    /// No registered route (or no handler for the verb) matched the request.
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    /// The handler declares a different number of route parameters than the route extracted.
    #[error("Parameter count mismatch: handler expects {expected}, route provided {actual}")]
    ParameterArity {
        /// Route parameters declared by the handler.
        expected: usize,
        /// Route parameters extracted from the request path.
        actual: usize,
    },

    /// A route parameter could not be converted to the declared argument type.
    #[error("Cannot convert route parameter '{name}' ('{raw}') to {target}")]
    ParameterCoercion {
        /// Parameter name from the template.
        name: String,
        /// Raw value taken from the request path.
        raw: String,
        /// Name of the declared target type.
        target: &'static str,
    },

    /// A write was attempted on a response that has already ended.
    #[error("Response has already ended")]
    ResponseEnded,

    /// A listen endpoint string could not be parsed.
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// An operation was attempted in the wrong server or session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The accept call failed.
    #[error("Accept failed: {0}")]
    AcceptLoop(String),

    /// The accept loop exceeded its restart budget and stopped for good.
    #[error("Accept loop stopped after {0} restarts")]
    AcceptLoopExhausted(u32),

    /// The request is not a valid WebSocket handshake, or the handshake failed.
    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),

    /// The WebSocket handshake did not complete within the configured timeout.
    #[error("WebSocket upgrade timed out after {0} ms")]
    UpgradeTimeout(u64),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handler-specific error.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Extractor failed for a reason other than route parameter binding.
    #[error("Extractor error: {0}")]
    Extractor(String),

    /// Custom error with a message.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// Result alias used throughout RouteForge.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error from any displayable message.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates a handler error.
    pub fn handler<T: fmt::Display>(msg: T) -> Self {
        Error::Handler(msg.to_string())
    }

    /// Creates an extractor error.
    pub fn extractor<T: fmt::Display>(msg: T) -> Self {
        Error::Extractor(msg.to_string())
    }

    /// Creates a parse error for a malformed request.
    pub fn parse<T: fmt::Display>(msg: T) -> Self {
        Error::Parse(msg.to_string())
    }

    /// Creates a configuration error.
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// The HTTP status the server answers with when this error escapes dispatch.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Error::Parse(_) | Error::ParameterCoercion { .. } => StatusCode::BAD_REQUEST,
            Error::Upgrade(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
