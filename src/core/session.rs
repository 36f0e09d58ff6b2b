//! Per-request session state
//!
//! A [`Session`] is the exclusive holder of one request/response cycle: the
//! buffered request, the response being built, a type-erased data bag for
//! plugins, and the response-set flag that drives short-circuiting.

use std::{any::Any, collections::HashMap};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use once_cell::sync::OnceCell;

/// Immutable view of the intercepted request.
///
/// The body is buffered once at interception time; repeated reads return
/// identical bytes even after the client socket has been consumed.
#[derive(Debug)]
pub struct RequestData {
    pub method: Method,
    /// Absolute request URL, e.g. `https://graph.microsoft.com/v1.0/me`.
    pub url: String,
    pub headers: HeaderMap,
    body: Bytes,
    body_string: OnceCell<String>,
}

impl RequestData {
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
            body,
            body_string: OnceCell::new(),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Memoized lossy UTF-8 view of the body.
    pub fn body_string(&self) -> &str {
        self.body_string
            .get_or_init(|| String::from_utf8_lossy(&self.body).into_owned())
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
        self.body_string = OnceCell::new();
    }

    /// Hostname of the destination, without port.
    pub fn host(&self) -> &str {
        let after_scheme = match self.url.find("://") {
            Some(idx) => &self.url[idx + 3..],
            None => self.url.as_str(),
        };
        let authority = after_scheme.split('/').next().unwrap_or(after_scheme);
        authority.split(':').next().unwrap_or(authority)
    }

    /// Path and query portion of the URL.
    pub fn path_and_query(&self) -> &str {
        let after_scheme = match self.url.find("://") {
            Some(idx) => &self.url[idx + 3..],
            None => return self.url.as_str(),
        };
        match after_scheme.find('/') {
            Some(idx) => &after_scheme[idx..],
            None => "/",
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The response under construction for one session.
#[derive(Debug)]
pub struct ResponseData {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for ResponseData {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Whether a plugin has produced the final response for this session.
///
/// Once flipped, the upstream fetch is skipped and later plugins in the
/// request phase must no-op via the standard guard.
#[derive(Debug, Default)]
pub struct ResponseState {
    pub has_been_set: bool,
}

/// Exclusive holder of one request/response cycle.
pub struct Session {
    /// Monotonic id; also the key for the buffered request logger.
    pub id: u64,
    pub request: RequestData,
    pub response: ResponseData,
    pub response_state: ResponseState,
    vars: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Session {
    pub fn new(id: u64, request: RequestData) -> Self {
        Self {
            id,
            request,
            response: ResponseData::default(),
            response_state: ResponseState::default(),
            vars: HashMap::new(),
        }
    }

    pub fn set_request_body(&mut self, body: Bytes) {
        self.request.set_body(body);
    }

    pub fn set_response_body(&mut self, body: Bytes) {
        self.response.body = body;
    }

    /// Terminal helper: install a synthetic response and mark it set.
    ///
    /// Has no effect when a previous plugin already set the response, which
    /// keeps the delivered bytes owned by the plugin that flipped the flag.
    pub fn set_generic_response(
        &mut self,
        status: StatusCode,
        headers: &[(String, String)],
        body: Bytes,
    ) {
        if self.response_state.has_been_set {
            return;
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    log::warn!("Dropping invalid response header name '{name}'");
                    continue;
                }
            };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    header_map.append(name, value);
                }
                Err(_) => log::warn!("Dropping invalid response header value for '{name}'"),
            }
        }

        self.response = ResponseData {
            status,
            headers: header_map,
            body,
        };
        self.response_state.has_been_set = true;
    }

    /// Store a typed value into the session's data bag
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the session's data bag
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vars.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.vars.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_session() -> Session {
        let request = RequestData::new(
            Method::GET,
            "https://graph.microsoft.com/v1.0/me",
            HeaderMap::new(),
            Bytes::new(),
        );
        Session::new(1, request)
    }

    #[test]
    fn test_host_and_path() {
        let session = get_session();
        assert_eq!(session.request.host(), "graph.microsoft.com");
        assert_eq!(session.request.path_and_query(), "/v1.0/me");
    }

    #[test]
    fn test_host_strips_port() {
        let request = RequestData::new(
            Method::GET,
            "http://localhost:3000/api/items?x=1",
            HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(request.host(), "localhost");
        assert_eq!(request.path_and_query(), "/api/items?x=1");
    }

    #[test]
    fn test_body_string_is_memoized() {
        let mut request = RequestData::new(
            Method::PATCH,
            "https://graph.microsoft.com/v1.0/me",
            HeaderMap::new(),
            Bytes::from_static(b"{\"displayName\":\"a\"}"),
        );
        let first = request.body_string().to_string();
        assert_eq!(first, request.body_string());

        // Replacing the body resets the memoized view.
        request.set_body(Bytes::from_static(b"{}"));
        assert_eq!(request.body_string(), "{}");
    }

    #[test]
    fn test_empty_patch_body_reads_identically() {
        let request = RequestData::new(
            Method::PATCH,
            "https://graph.microsoft.com/v1.0/me",
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(request.body().is_empty());
        assert_eq!(request.body_string(), "");
        assert!(request.body().is_empty());
    }

    #[test]
    fn test_generic_response_marks_set() {
        let mut session = get_session();
        session.set_generic_response(
            StatusCode::TOO_MANY_REQUESTS,
            &[("Retry-After".to_string(), "5".to_string())],
            Bytes::from_static(b"slow down"),
        );
        assert!(session.response_state.has_been_set);
        assert_eq!(session.response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(session.response.headers.get("Retry-After").unwrap(), "5");
    }

    #[test]
    fn test_set_response_is_not_overwritten() {
        let mut session = get_session();
        session.set_generic_response(
            StatusCode::OK,
            &[],
            Bytes::from_static(b"first"),
        );
        session.set_generic_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &[],
            Bytes::from_static(b"second"),
        );
        assert_eq!(session.response.status, StatusCode::OK);
        assert_eq!(&session.response.body[..], b"first");
    }

    #[test]
    fn test_vars_bag() {
        let mut session = get_session();
        session.set("attempts", 3usize);
        assert_eq!(session.get::<usize>("attempts"), Some(&3));
        assert!(session.get::<String>("attempts").is_none());
        session.remove("attempts");
        assert!(!session.contains("attempts"));
    }
}
