//! Well-known [`RequestMap`](super::RequestMap) keys.
//!
//! Each constant documents the type stored under it.

/// [`Method`](crate::http::Method) from the request line.
pub const METHOD: &str = "request.method";

/// `String` path without the query string.
pub const PATH: &str = "request.path";

/// `String` raw query string without the leading `?`. Absent when the
/// request target has none.
pub const QUERY: &str = "request.query";

/// `u8` HTTP minor version (0 for HTTP/1.0, 1 for HTTP/1.1).
pub const VERSION: &str = "request.version";

/// [`Headers`](crate::http::Headers) received with the request.
pub const HEADERS: &str = "request.headers";

/// [`Bytes`](bytes::Bytes) request body, empty when none was sent.
pub const BODY: &str = "request.body";

/// [`StatusCode`](crate::http::StatusCode) staged by the application.
/// Defaults to `200 OK` when absent.
pub const RESPONSE_STATUS: &str = "response.status";

/// [`Headers`](crate::http::Headers) staged by the application.
pub const RESPONSE_HEADERS: &str = "response.headers";

/// [`Bytes`](bytes::Bytes) staged response body.
pub const RESPONSE_BODY: &str = "response.body";
