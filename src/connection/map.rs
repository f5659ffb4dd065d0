//! The request-attribute map shared between the parser, the application and
//! the response writer.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use super::keys;
use crate::http::{Headers, Method, StatusCode};

/// String-keyed map of arbitrarily typed request attributes.
///
/// The parser fills the `request.*` keys, the application reads them and
/// stages its answer under the `response.*` keys. Values are type-erased;
/// reads name the expected type and yield `None` on a mismatch.
///
/// # Examples
///
/// ```
/// use fluxhttp::connection::{RequestMap, keys};
/// use fluxhttp::http::StatusCode;
///
/// let mut env = RequestMap::new();
/// env.insert("app.user", String::from("alice"));
/// env.set_status(StatusCode::Created);
///
/// assert_eq!(env.get::<String>("app.user").map(String::as_str), Some("alice"));
/// assert_eq!(env.get::<u32>("app.user"), None);
/// assert_eq!(env.get::<StatusCode>(keys::RESPONSE_STATUS), Some(&StatusCode::Created));
/// ```
#[derive(Default)]
pub struct RequestMap {
    map: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing whatever was there.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(key.into(), Box::new(value));
    }

    pub fn get<T>(&self, key: &str) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self, key: &str) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes `key` and returns its value if it had type `T`.
    ///
    /// An entry of a different type is still removed.
    pub fn remove<T>(&mut self, key: &str) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every attribute but keeps the allocation for reuse.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    // ── Request accessors ────────────────────────────────────────────────────

    pub fn method(&self) -> Option<&Method> {
        self.get(keys::METHOD)
    }

    pub fn path(&self) -> Option<&str> {
        self.get::<String>(keys::PATH).map(String::as_str)
    }

    pub fn query_string(&self) -> Option<&str> {
        self.get::<String>(keys::QUERY).map(String::as_str)
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.get(keys::HEADERS)
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.get(keys::BODY)
    }

    // ── Response staging ─────────────────────────────────────────────────────

    pub fn set_status(&mut self, status: StatusCode) {
        self.insert(keys::RESPONSE_STATUS, status);
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.insert(keys::RESPONSE_BODY, body.into());
    }

    /// Returns the staged response headers, creating an empty set on first use.
    pub fn response_headers_mut(&mut self) -> &mut Headers {
        if self.get::<Headers>(keys::RESPONSE_HEADERS).is_none() {
            self.insert(keys::RESPONSE_HEADERS, Headers::new());
        }
        self.get_mut(keys::RESPONSE_HEADERS)
            .unwrap_or_else(|| unreachable!("response headers were inserted above"))
    }
}

impl fmt::Debug for RequestMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("RequestMap").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_get_rejects_wrong_type() {
        let mut env = RequestMap::new();
        env.insert("n", 7u32);
        assert_eq!(env.get::<u32>("n"), Some(&7));
        assert_eq!(env.get::<i64>("n"), None);
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut env = RequestMap::new();
        env.insert("k", 1u8);
        env.insert("k", String::from("two"));
        assert_eq!(env.len(), 1);
        assert_eq!(env.get::<String>("k").map(String::as_str), Some("two"));
    }

    #[test]
    fn remove_returns_owned_value() {
        let mut env = RequestMap::new();
        env.insert("k", vec![1, 2, 3]);
        assert_eq!(env.remove::<Vec<i32>>("k"), Some(vec![1, 2, 3]));
        assert!(!env.contains_key("k"));
    }

    #[test]
    fn response_headers_created_on_demand() {
        let mut env = RequestMap::new();
        env.response_headers_mut().insert("X-One", "1");
        env.response_headers_mut().insert("X-Two", "2");
        let staged: &Headers = env.get(keys::RESPONSE_HEADERS).unwrap();
        assert_eq!(staged.len(), 2);
    }

    #[test]
    fn clear_empties_map() {
        let mut env = RequestMap::new();
        env.set_body("hello");
        env.set_status(StatusCode::Accepted);
        env.clear();
        assert!(env.is_empty());
    }
}
