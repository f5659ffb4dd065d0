//! Serializes the response an application staged in its request map.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};
use crate::connection::{RequestMap, keys};

/// An HTTP/1.1 response ready to be written.
///
/// Usually built with [`Response::from_staged`] from the `response.*` keys an
/// application callback left behind. Every response is written with
/// `Connection: close`; the connection object returns to the pool after one
/// exchange.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use fluxhttp::connection::RequestMap;
/// use fluxhttp::http::{Response, StatusCode};
///
/// let mut env = RequestMap::new();
/// env.set_status(StatusCode::Created);
/// env.response_headers_mut().insert("Content-Type", "application/json");
/// env.set_body(r#"{"id":1}"#);
///
/// let mut buf = BytesMut::new();
/// Response::from_staged(&mut env).write_to(&mut buf);
/// let text = std::str::from_utf8(&buf).unwrap();
/// assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(text.contains("Content-Length: 8\r\n"));
/// assert!(text.ends_with("\r\n\r\n{\"id\":1}"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Takes the staged status, headers and body out of `env`.
    ///
    /// Missing keys fall back to `200 OK`, no extra headers and an empty body.
    pub fn from_staged(env: &mut RequestMap) -> Self {
        Self {
            status: env
                .remove::<StatusCode>(keys::RESPONSE_STATUS)
                .unwrap_or_default(),
            headers: env
                .remove::<Headers>(keys::RESPONSE_HEADERS)
                .unwrap_or_default(),
            body: env.remove::<Bytes>(keys::RESPONSE_BODY).unwrap_or_default(),
        }
    }

    /// Appends the wire form of this response to `buf`.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` when there is a body
    /// and no content type, and always sets `Connection: close` and
    /// `Content-Length`, replacing any staged values for those two.
    pub fn write_to(mut self, buf: &mut BytesMut) {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        self.headers.set("Connection", "close");
        self.headers.remove("content-length");

        buf.reserve(128 + self.headers.len() * 64 + content_length);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(self.headers.to_string().as_bytes());
        buf.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());
        buf.put(self.body);
    }

    pub fn into_bytes(self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
