//! Outgoing HTTP responses.
//!
//! A [`Response`] is created fresh for every request and is owned by the
//! connection task that read the request. Handlers receive a cheap clone of the
//! same handle, so every handler invoked for a request writes into one response.
//!
//! ```text
//! Created ──(status / headers / body writes)*──> Ended
//! ```
//!
//! Once ended, any further write fails with [`Error::ResponseEnded`]. The server
//! serializes the response after dispatch returns.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::websocket::upgrade::Upgraded;

struct ResponseInner {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    ended: bool,
    upgrade: Option<oneshot::Sender<Upgraded>>,
}

/// Shared handle to the response of one request.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Mutex<ResponseInner>>,
}

impl Response {
    /// A new `200 OK` response with no headers and an empty body.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResponseInner {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: BytesMut::new(),
                ended: false,
                upgrade: None,
            })),
        }
    }

    /// An already ended response carrying a plain-text error body.
    pub fn error(status: StatusCode) -> Self {
        let response = Self::new();
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!("{} {}", status.as_u16(), reason);
        // a fresh response is never ended, so this cannot fail
        let _ = response.send(status, "text/plain; charset=utf-8", body);
        response
    }

    fn write_guard(&self) -> Result<parking_lot::MutexGuard<'_, ResponseInner>> {
        let inner = self.inner.lock();
        if inner.ended {
            return Err(Error::ResponseEnded);
        }
        Ok(inner)
    }

    /// Current status code.
    pub fn status(&self) -> StatusCode {
        self.inner.lock().status
    }

    /// Sets the status code.
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        self.write_guard()?.status = status;
        Ok(())
    }

    /// A header value as text.
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Sets a header, replacing existing values with the same name.
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let (name, value) = parse_header(name, value)?;
        self.write_guard()?.headers.insert(name, value);
        Ok(())
    }

    /// Appends a header value, keeping existing values with the same name.
    pub fn append_header(&self, name: &str, value: &str) -> Result<()> {
        let (name, value) = parse_header(name, value)?;
        self.write_guard()?.headers.append(name, value);
        Ok(())
    }

    /// A copy of all headers.
    pub fn headers(&self) -> HeaderMap {
        self.inner.lock().headers.clone()
    }

    /// Appends bytes to the body.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.write_guard()?.body.extend_from_slice(data.as_ref());
        Ok(())
    }

    /// A copy of the body written so far.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().body)
    }

    /// Ends the response. Ending twice is an error.
    pub fn end(&self) -> Result<()> {
        self.write_guard()?.ended = true;
        Ok(())
    }

    /// Whether the response has ended.
    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Replaces the body, sets the content type and ends the response, keeping the
    /// current status.
    pub fn send_body(&self, content_type: &str, body: impl AsRef<[u8]>) -> Result<()> {
        let content_type = HeaderValue::from_str(content_type)
            .map_err(|e| Error::handler(format!("invalid content type: {}", e)))?;
        let mut inner = self.write_guard()?;
        inner.headers.insert(CONTENT_TYPE, content_type);
        inner.body.clear();
        inner.body.extend_from_slice(body.as_ref());
        inner.ended = true;
        Ok(())
    }

    /// Sets the status, content type and body, then ends the response.
    pub fn send(&self, status: StatusCode, content_type: &str, body: impl AsRef<[u8]>) -> Result<()> {
        self.set_status(status)?;
        self.send_body(content_type, body)
    }

    /// Sets the status and ends the response with an empty body.
    pub fn send_status(&self, status: StatusCode) -> Result<()> {
        let mut inner = self.write_guard()?;
        inner.status = status;
        inner.ended = true;
        Ok(())
    }

    /// Ends the response as `101 Switching Protocols` and registers the channel the
    /// server hands the raw connection to once the head has been written.
    pub(crate) fn switch_protocols(
        &self,
        headers: Vec<(HeaderName, HeaderValue)>,
    ) -> Result<oneshot::Receiver<Upgraded>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.write_guard()?;
        inner.status = StatusCode::SWITCHING_PROTOCOLS;
        for (name, value) in headers {
            inner.headers.insert(name, value);
        }
        inner.body.clear();
        inner.ended = true;
        inner.upgrade = Some(tx);
        Ok(rx)
    }

    pub(crate) fn take_upgrade(&self) -> Option<oneshot::Sender<Upgraded>> {
        self.inner.lock().upgrade.take()
    }

    /// Snapshot used for serialization.
    pub(crate) fn parts(&self) -> (StatusCode, HeaderMap, Bytes) {
        let inner = self.inner.lock();
        (
            inner.status,
            inner.headers.clone(),
            Bytes::copy_from_slice(&inner.body),
        )
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Response")
            .field("status", &inner.status)
            .field("headers", &inner.headers)
            .field("body_len", &inner.body.len())
            .field("ended", &inner.ended)
            .finish()
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::handler(format!("invalid header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::handler(format!("invalid header value for '{}': {}", name, e)))?;
    Ok((name, value))
}
