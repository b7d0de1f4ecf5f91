//! Transport queue for Matrix client-server requests.
//!
//! This module turns a logical [`Request`] into an HTTP call against the
//! session homeserver and hands back the parsed JSON body or a classified
//! [`crate::matrix::Error`]. It knows nothing about the protocol beyond
//! recognising Matrix error bodies and their rate-limit hint; retry, re-login
//! and reconnect policy belong to the orchestrator.
//!
//! # Modules
//!
//! - `net` - HTTP sessions, priority lanes, JSON and error parsing, uploads
//! - `download` - authenticated media download with optional decryption

mod download;
mod net;

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use zeroize::Zeroize;

pub use crate::transport::download::Progress;
pub use crate::transport::net::MatrixNet;

/// Path prefix of the client-server API.
const CLIENT_API_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

/// Scheduling priority of a request.
///
/// `High` requests run on a dedicated lane so a standing long-poll never waits
/// behind, nor blocks, ordinary requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Default,
    High,
}

/// A logical request, consumed by [`MatrixNet::send`].
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) priority: Priority,
    pub(crate) method: Method,
    /// Unencoded path segments, joined against the homeserver
    pub(crate) segments: Vec<String>,
    pub(crate) body: Option<Value>,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
    /// The body carries credentials and is wiped on drop
    pub(crate) sensitive: bool,
}

impl Request {
    /// Creates a request for a raw path, given as unencoded segments.
    pub fn new(method: Method, segments: &[&str]) -> Self {
        Request {
            priority: Priority::Default,
            method,
            segments: segments.iter().map(|segment| segment.to_string()).collect(),
            body: None,
            query: Vec::new(),
            timeout: None,
            sensitive: false,
        }
    }

    /// Creates a request below `/_matrix/client/v3`.
    pub fn client(method: Method, segments: &[&str]) -> Self {
        let full: Vec<&str> = CLIENT_API_PREFIX
            .iter()
            .copied()
            .chain(segments.iter().copied())
            .collect();
        Request::new(method, &full)
    }

    pub fn get(segments: &[&str]) -> Self {
        Request::client(Method::GET, segments)
    }

    pub fn post(segments: &[&str], body: Value) -> Self {
        Request::client(Method::POST, segments).body(body)
    }

    pub fn put(segments: &[&str], body: Value) -> Self {
        Request::client(Method::PUT, segments).body(body)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_owned(), value.into()));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the body as holding credentials. Its strings are zeroized when
    /// the request is dropped.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Unencoded path, for logs.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.sensitive
            && let Some(body) = self.body.as_mut()
        {
            zeroize_strings(body);
        }
    }
}

/// Wipes every string held by a JSON value, keys excepted.
pub(crate) fn zeroize_strings(value: &mut Value) {
    match value {
        Value::String(text) => text.zeroize(),
        Value::Array(items) => items.iter_mut().for_each(zeroize_strings),
        Value::Object(fields) => fields.values_mut().for_each(zeroize_strings),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_request_is_prefixed() {
        let request = Request::get(&["rooms", "!room:example.org", "members"]);
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(
            request.path(),
            "/_matrix/client/v3/rooms/!room:example.org/members"
        );
        assert_eq!(request.priority, Priority::Default);
    }

    #[test]
    fn test_builder_collects_query_and_body() {
        let request = Request::post(&["login"], json!({"type": "m.login.password"}))
            .query("a", "1")
            .query("b", "2")
            .priority(Priority::High)
            .timeout(Duration::from_secs(5));

        assert_eq!(request.query_value("a"), Some("1"));
        assert_eq!(request.query_value("b"), Some("2"));
        assert_eq!(request.query_value("c"), None);
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.body.as_ref().unwrap()["type"], "m.login.password");
        assert!(!request.sensitive);
    }

    #[test]
    fn test_zeroize_strings_wipes_nested_values() {
        let mut body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": "alice"},
            "password": "secret",
            "devices": ["DEVICE"],
            "refresh": true,
        });
        zeroize_strings(&mut body);
        assert_eq!(
            body,
            json!({
                "type": "",
                "identifier": {"type": "", "user": ""},
                "password": "",
                "devices": [""],
                "refresh": true,
            })
        );
    }

    #[test]
    fn test_sensitive_request_keeps_body_until_dropped() {
        let request = Request::post(&["login"], json!({"password": "secret"})).sensitive();
        assert!(request.sensitive);
        assert_eq!(request.body.as_ref().unwrap()["password"], "secret");
    }
}
