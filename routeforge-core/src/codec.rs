//! HTTP/1.x wire format.
//!
//! Requests are parsed incrementally out of a connection buffer: [`parse_request`]
//! returns `Ok(None)` until a complete request (head and body) is available, and the
//! number of bytes consumed once it is. Bodies are framed by `Content-Length` or by
//! chunked transfer encoding.

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::request::Request;

/// Size limits applied while reading requests.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum size of the request line plus headers.
    pub max_head_bytes: usize,
    /// Maximum size of a decoded request body.
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses one request from the start of `buf`.
pub fn parse_request(buf: &[u8], limits: &Limits) -> Result<Option<(Request, usize)>> {
    let Some(head_end) = find_subslice(buf, b"\r\n\r\n") else {
        if buf.len() > limits.max_head_bytes {
            return Err(Error::parse("request head too large"));
        }
        return Ok(None);
    };
    if head_end > limits.max_head_bytes {
        return Err(Error::parse("request head too large"));
    }

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::parse("request head is not valid UTF-8"))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::parse(format!("bad request line '{}'", request_line)));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::parse(format!("bad method '{}'", method)))?;
    if target.is_empty() {
        return Err(Error::parse("empty request target"));
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(Error::parse(format!("unsupported version '{}'", other))),
    };

    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("bad header line '{}'", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::parse(format!("bad header name '{}'", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::parse(format!("bad value for header '{}'", name)))?;
        headers.append(name, value);
    }

    let body_start = head_end + 4;
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let (body, consumed) = if chunked {
        match decode_chunked(&buf[body_start..], limits.max_body_bytes)? {
            Some((body, used)) => (body, body_start + used),
            None => return Ok(None),
        }
    } else {
        let length = match headers.get(CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| Error::parse("bad Content-Length"))?,
            None => 0,
        };
        if length > limits.max_body_bytes {
            return Err(Error::parse("request body too large"));
        }
        if buf.len() < body_start + length {
            return Ok(None);
        }
        (
            Bytes::copy_from_slice(&buf[body_start..body_start + length]),
            body_start + length,
        )
    };

    let request = Request::from_parts(method, target.to_string(), version, headers, body)?;
    Ok(Some((request, consumed)))
}

fn decode_chunked(buf: &[u8], max_body: usize) -> Result<Option<(Bytes, usize)>> {
    let mut body = BytesMut::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = find_subslice(&buf[pos..], b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[pos..pos + line_end])
            .map_err(|_| Error::parse("bad chunk size"))?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| Error::parse(format!("bad chunk size '{}'", size_text)))?;
        pos += line_end + 2;

        if size == 0 {
            // optional trailers, terminated by an empty line
            loop {
                let Some(end) = find_subslice(&buf[pos..], b"\r\n") else {
                    return Ok(None);
                };
                pos += end + 2;
                if end == 0 {
                    return Ok(Some((body.freeze(), pos)));
                }
            }
        }

        if body.len() + size > max_body {
            return Err(Error::parse("request body too large"));
        }
        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(Error::parse("chunk not terminated by CRLF"));
        }
        pos += size + 2;
    }
}

/// Reads the next request from `stream`, buffering into `buf`.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between requests.
/// Bytes read past the end of the request stay in `buf`.
pub async fn read_request<S>(stream: &mut S, buf: &mut BytesMut, limits: &Limits) -> Result<Option<Request>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some((request, consumed)) = parse_request(buf, limits)? {
                let _ = buf.split_to(consumed);
                return Ok(Some(request));
            }
        }
        buf.reserve(4096);
        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::parse("connection closed in the middle of a request"));
        }
    }
}

fn status_has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Serializes a response head and body.
///
/// `Content-Length` is always set from the body for statuses that carry one, and
/// `Connection: close` is added when the connection will not be reused. With
/// `head_only` the body is left out but the length still describes it.
pub fn encode_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    head_only: bool,
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        if name == CONNECTION && status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if status_has_body(status) {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    if status != StatusCode::SWITCHING_PROTOCOLS && !keep_alive {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");

    if status_has_body(status) && !head_only {
        out.extend_from_slice(body);
    }
    out
}

/// Writes a serialized response and flushes the stream.
pub async fn write_response<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    head_only: bool,
    keep_alive: bool,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = encode_response(status, headers, body, head_only, keep_alive);
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
