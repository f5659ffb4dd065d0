//! HTTP/1.1 request parsing into a [`RequestMap`] using [`httparse`].
//!
//! The parser is pure: it looks at the bytes buffered so far and either
//! reports that more are needed or fills the `request.*` keys. Nothing is
//! written to the map until a whole request (headers plus any
//! `Content-Length` body) is present, so calling it again after more bytes
//! arrive is always safe.

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};
use crate::connection::{RequestMap, keys};

/// Maximum number of headers accepted per request.
const MAX_HEADERS: usize = 64;

/// Result of a successful parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The map is filled; `consumed` bytes made up the request.
    Complete { consumed: usize },
    /// Headers or body are still incomplete.
    Partial,
}

/// Errors that make a request unanswerable except with a canned error.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("request exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
}

/// Parses `buf` into `env` with no size limit.
///
/// # Examples
///
/// ```
/// use fluxhttp::connection::RequestMap;
/// use fluxhttp::http::parser::{parse, ParseStatus};
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let mut env = RequestMap::new();
/// assert_eq!(parse(raw, &mut env).unwrap(), ParseStatus::Complete { consumed: raw.len() });
/// assert_eq!(env.path(), Some("/hello"));
/// assert_eq!(env.query_string(), Some("name=world"));
/// ```
pub fn parse(buf: &[u8], env: &mut RequestMap) -> Result<ParseStatus, RequestError> {
    parse_with_limit(buf, env, usize::MAX)
}

/// Parses `buf` into `env`, rejecting requests whose headers plus declared
/// body would exceed `max_bytes`.
///
/// # Errors
///
/// - [`RequestError::Parse`]: malformed request line or headers.
/// - [`RequestError::MissingField`]: method, path or version absent.
/// - [`RequestError::InvalidContentLength`]: unparseable `Content-Length`.
/// - [`RequestError::TooLarge`]: the request is over `max_bytes`.
pub fn parse_with_limit(
    buf: &[u8],
    env: &mut RequestMap,
    max_bytes: usize,
) -> Result<ParseStatus, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Request::new(&mut headers);

    let body_offset = match raw.parse(buf)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial if buf.len() > max_bytes => {
            return Err(RequestError::TooLarge { max_bytes });
        }
        httparse::Status::Partial => return Ok(ParseStatus::Partial),
    };

    let method: Method = match raw.method {
        Some(m) => m.parse().unwrap_or_else(|never| match never {}),
        None => return Err(RequestError::MissingField { field: "method" }),
    };
    let target = raw
        .path
        .ok_or(RequestError::MissingField { field: "path" })?;
    let version = raw
        .version
        .ok_or(RequestError::MissingField { field: "version" })?;

    let mut header_map = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            header_map.insert(header.name, value);
        }
    }

    let content_length = match header_map.get("content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| RequestError::InvalidContentLength)?,
        None => 0,
    };
    let total = body_offset
        .checked_add(content_length)
        .ok_or(RequestError::TooLarge { max_bytes })?;
    if total > max_bytes {
        return Err(RequestError::TooLarge { max_bytes });
    }
    if buf.len() < total {
        return Ok(ParseStatus::Partial);
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    };

    env.insert(keys::METHOD, method);
    env.insert(keys::PATH, path);
    if let Some(query) = query {
        env.insert(keys::QUERY, query);
    }
    env.insert(keys::VERSION, version);
    env.insert(keys::HEADERS, header_map);
    env.insert(keys::BODY, Bytes::copy_from_slice(&buf[body_offset..total]));

    Ok(ParseStatus::Complete { consumed: total })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(raw: &[u8]) -> RequestMap {
        let mut env = RequestMap::new();
        assert!(matches!(
            parse(raw, &mut env).unwrap(),
            ParseStatus::Complete { .. }
        ));
        env
    }

    #[test]
    fn simple_get() {
        let env = parse_ok(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(env.method(), Some(&Method::Get));
        assert_eq!(env.path(), Some("/"));
        assert_eq!(env.get::<u8>(keys::VERSION), Some(&1));
        assert_eq!(env.headers().unwrap().get("host"), Some("localhost"));
        assert!(env.body().unwrap().is_empty());
        assert_eq!(env.query_string(), None);
    }

    #[test]
    fn partial_headers_leave_map_untouched() {
        let mut env = RequestMap::new();
        let status = parse(b"GET / HTTP/1.1\r\nHost:", &mut env).unwrap();
        assert_eq!(status, ParseStatus::Partial);
        assert!(env.is_empty());
    }

    #[test]
    fn empty_input_is_partial() {
        let mut env = RequestMap::new();
        assert_eq!(parse(b"", &mut env).unwrap(), ParseStatus::Partial);
        assert!(env.is_empty());
    }

    #[test]
    fn waits_for_full_body() {
        let mut env = RequestMap::new();
        let head = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(parse(head, &mut env).unwrap(), ParseStatus::Partial);

        let full = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(
            parse(full, &mut env).unwrap(),
            ParseStatus::Complete { consumed: full.len() }
        );
        assert_eq!(env.body().map(|b| &b[..]), Some(&b"hello"[..]));
        assert_eq!(env.method(), Some(&Method::Post));
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let raw = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut env = RequestMap::new();
        let status = parse(raw, &mut env).unwrap();
        assert_eq!(status, ParseStatus::Complete { consumed: 19 });
        assert_eq!(env.path(), Some("/a"));
    }

    #[test]
    fn malformed_request_line_is_an_error() {
        let mut env = RequestMap::new();
        let err = parse(b"G\x00T / HTTP/1.1\r\n\r\n", &mut env).unwrap_err();
        assert!(matches!(err, RequestError::Parse(_)));
    }

    #[test]
    fn bad_content_length_is_an_error() {
        let mut env = RequestMap::new();
        let err = parse(b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n", &mut env).unwrap_err();
        assert!(matches!(err, RequestError::InvalidContentLength));
    }

    #[test]
    fn declared_body_over_limit_is_rejected_early() {
        let mut env = RequestMap::new();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 100000\r\n\r\n";
        let err = parse_with_limit(raw, &mut env, 1024).unwrap_err();
        assert!(matches!(err, RequestError::TooLarge { max_bytes: 1024 }));
    }

    #[test]
    fn oversized_partial_headers_are_rejected() {
        let mut env = RequestMap::new();
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 64));
        let err = parse_with_limit(&raw, &mut env, 32).unwrap_err();
        assert!(matches!(err, RequestError::TooLarge { .. }));
    }

    #[test]
    fn custom_method_is_preserved() {
        let env = parse_ok(b"PURGE /cache HTTP/1.1\r\n\r\n");
        assert_eq!(env.method().map(Method::as_str), Some("PURGE"));
    }
}
