//! # RouteForge - HTTP Routing and WebSocket Sessions for Rust
//!
//! RouteForge maps HTTP requests to async handlers through path templates with
//! typed parameters, serves them from a resilient accept loop and upgrades
//! connections to WebSocket sessions on the same port.
//!
//! This crate re-exports [`routeforge_core`]; see its documentation for the module
//! reference.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! routeforge = "0.1.0"
//! tokio = { version = "1.40", features = ["full"] }
//! ```
//!
//! ```no_run
//! use routeforge::prelude::*;
//!
//! async fn greet(Param(name): Param<String>) -> String {
//!     format!("Hello, {}!", name)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Router::new()
//!         .get("/hello/{name}", handler(greet))
//!         .listen("http://127.0.0.1:8080/")
//!         .await
//! }
//! ```
//!
//! ## Typed Parameters
//!
//! Route parameters are inferred as integers, big integers, decimals, floats,
//! GUIDs, timestamps or strings, then converted to the argument type the handler
//! declares:
//!
//! ```
//! use routeforge::prelude::*;
//!
//! async fn invoice(Param(customer): Param<String>, Param(number): Param<u32>) -> String {
//!     format!("{} #{}", customer, number)
//! }
//!
//! let router = Router::new().get("/customers/{customer}/invoices/:number:", handler(invoice));
//! ```
//!
//! A parameter that cannot be converted is answered with `400 Bad Request`.
//!
//! ## Shared State and Controllers
//!
//! ```
//! use routeforge::prelude::*;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct Hits(AtomicU64);
//!
//! impl Controller for Hits {}
//!
//! async fn hit(hits: Arc<Hits>) -> String {
//!     hits.0.fetch_add(1, Ordering::Relaxed).to_string()
//! }
//!
//! let router = Router::new().get("/hits", handler(hit));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub use routeforge_core::*;

/// Commonly used types and traits.
pub mod prelude {
    pub use routeforge_core::prelude::*;
}
