//! Mock responder
//!
//! Serves responses declared in the hot-reloaded mocks file instead of
//! calling the real API. Matching is first-in-first-out over the mock
//! list after a method filter; a rule with `nth` only fires on its Nth
//! URL match and is passed over before and after that.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{Method, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DisplayFromStr};
use validator::Validate;

use crate::{
    config::{
        loader::{FileLoader, LoadableConfig},
        resolve_config_path,
    },
    core::{
        request_guard, watch::compile_wildcard, ProxyContext, ProxyError, ProxyPlugin,
        ProxyResult, Session, WatchSet,
    },
    logging::{MessageType, RequestLog},
    utils::response::{HeaderEntry, ResponseBuilder},
};

pub const PLUGIN_NAME: &str = "mock-response";

/// Creates a Mock Response plugin instance with the given configuration.
pub fn create_mock_response_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    let mocks_path = resolve_config_path(&config.mocks_file, &ctx.app_folder);
    let loader = FileLoader::<MocksFile>::new(mocks_path);

    Ok(Arc::new(PluginMockResponse {
        watch,
        loader,
        nth_counters: DashMap::new(),
        counters_generation: Mutex::new(0),
    }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    #[validate(length(min = 1))]
    mocks_file: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            mocks_file: "mocks.json".to_string(),
        }
    }
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::serialization_error("Invalid mock response plugin config", e))?;
        config.validate()?;
        Ok(config)
    }
}

/// Request side of one mock rule.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRequest {
    /// Literal URL, path, or `*`-wildcard pattern.
    pub url: String,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "MockRequest::default_method")]
    pub method: Method,

    /// 1-based: only the Nth match of this rule fires.
    #[serde(default)]
    pub nth: Option<u32>,
}

impl MockRequest {
    fn default_method() -> Method {
        Method::GET
    }
}

/// Response side of one mock rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponseSpec {
    #[serde(default = "MockResponseSpec::default_status_code")]
    pub status_code: u16,

    #[serde(default)]
    pub headers: Vec<HeaderEntry>,

    /// JSON value, plain string, or `"@path"` naming a file whose bytes
    /// are served verbatim.
    #[serde(default)]
    pub body: Option<JsonValue>,
}

impl MockResponseSpec {
    fn default_status_code() -> u16 {
        200
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponse {
    pub request: MockRequest,
    #[serde(default)]
    pub response: Option<MockResponseSpec>,
}

/// Body shape, classified once at load time.
#[derive(Debug, Clone)]
enum MockBody {
    Empty,
    Json(JsonValue),
    Text(String),
    File(String),
}

/// URL matcher, compiled once at load time.
#[derive(Debug)]
enum MockMatcher {
    Exact(String),
    Wildcard(Regex),
}

impl MockMatcher {
    fn matches(&self, url: &str, path_and_query: &str) -> bool {
        match self {
            MockMatcher::Exact(pattern) => pattern == url || pattern == path_and_query,
            MockMatcher::Wildcard(regex) => regex.is_match(url) || regex.is_match(path_and_query),
        }
    }
}

#[derive(Debug)]
struct CompiledMock {
    matcher: MockMatcher,
    body: MockBody,
}

/// The hot-reloaded `mocks.json` shape plus its compiled artifacts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MocksFile {
    #[serde(default)]
    pub mocks: Vec<MockResponse>,

    #[serde(skip)]
    compiled: Vec<CompiledMock>,
}

impl LoadableConfig for MocksFile {
    const KIND: &'static str = "mocks";

    fn from_json(text: &str) -> ProxyResult<Self> {
        let mut parsed: MocksFile = serde_json::from_str(text)?;

        for mock in &parsed.mocks {
            if let Some(nth) = mock.request.nth {
                if nth == 0 {
                    return Err(ProxyError::Validation(
                        "Mock 'nth' is 1-based and must be at least 1".to_string(),
                    ));
                }
            }
        }

        parsed.compiled = parsed
            .mocks
            .iter()
            .map(|mock| {
                let matcher = if mock.request.url.contains('*') {
                    MockMatcher::Wildcard(compile_wildcard(&mock.request.url)?)
                } else {
                    MockMatcher::Exact(mock.request.url.clone())
                };
                let body = match mock.response.as_ref().and_then(|r| r.body.clone()) {
                    None => MockBody::Empty,
                    Some(JsonValue::String(s)) => match s.strip_prefix('@') {
                        Some(path) => MockBody::File(path.to_string()),
                        None => MockBody::Text(s),
                    },
                    Some(other) => MockBody::Json(other),
                };
                Ok(CompiledMock { matcher, body })
            })
            .collect::<ProxyResult<Vec<_>>>()?;

        Ok(parsed)
    }

    fn empty() -> Self {
        Self::default()
    }
}

pub struct PluginMockResponse {
    watch: WatchSet,
    loader: Arc<FileLoader<MocksFile>>,
    /// Match counts for `nth` rules, keyed by rule index.
    nth_counters: DashMap<usize, u64>,
    /// Snapshot pointer the counters belong to; a reload resets them.
    counters_generation: Mutex<usize>,
}

impl PluginMockResponse {
    fn reset_counters_on_reload(&self, snapshot: &Arc<MocksFile>) {
        let generation = Arc::as_ptr(snapshot) as usize;
        let mut current = self
            .counters_generation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *current != generation {
            self.nth_counters.clear();
            *current = generation;
        }
    }

    fn find_match(&self, snapshot: &MocksFile, session: &Session) -> Option<usize> {
        let url = &session.request.url;
        let path_and_query = session.request.path_and_query();

        for (idx, mock) in snapshot.mocks.iter().enumerate() {
            if mock.request.method != session.request.method {
                continue;
            }
            if !snapshot.compiled[idx].matcher.matches(url, path_and_query) {
                continue;
            }
            if let Some(nth) = mock.request.nth {
                let mut count = self.nth_counters.entry(idx).or_insert(0);
                *count += 1;
                if *count != nth as u64 {
                    // Counting toward the Nth hit, or exhausted after it:
                    // either way this rule is passed over.
                    continue;
                }
            }
            return Some(idx);
        }
        None
    }

    async fn resolve_body(
        &self,
        body: &MockBody,
        session: &Session,
        ctx: &ProxyContext,
    ) -> ResolvedBody {
        match body {
            MockBody::Empty => ResolvedBody::Raw(Bytes::new()),
            MockBody::Text(text) => ResolvedBody::Raw(Bytes::from(text.clone())),
            MockBody::Json(value) => ResolvedBody::Json(value.clone()),
            MockBody::File(path) => {
                let resolved = resolve_config_path(path, &ctx.app_folder);
                let resolved = if resolved.is_relative() {
                    match self.loader.path().parent() {
                        Some(parent) => parent.join(resolved),
                        None => resolved,
                    }
                } else {
                    resolved
                };
                match tokio::fs::read(&resolved).await {
                    Ok(bytes) => ResolvedBody::Raw(Bytes::from(bytes)),
                    Err(e) => {
                        log::error!("Cannot read mock body file {}: {e}", resolved.display());
                        ctx.logger.log(
                            session.id,
                            RequestLog::single(
                                MessageType::Failed,
                                format!("Cannot read mock body file {}", resolved.display()),
                            )
                            .with_plugin(PLUGIN_NAME),
                        );
                        ResolvedBody::Raw(Bytes::from(format!("@{path}")))
                    }
                }
            }
        }
    }
}

/// A mock body ready to be written to the session.
enum ResolvedBody {
    Raw(Bytes),
    Json(JsonValue),
}

#[async_trait]
impl ProxyPlugin for PluginMockResponse {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn init(&self, _ctx: &ProxyContext) -> ProxyResult<()> {
        self.loader.init_watcher()
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let snapshot = self.loader.snapshot();
        self.reset_counters_on_reload(&snapshot);

        let Some(idx) = self.find_match(&snapshot, session) else {
            return Ok(());
        };

        let mock = &snapshot.mocks[idx];
        let status = mock
            .response
            .as_ref()
            .map(|r| r.status_code)
            .unwrap_or(200);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        let headers: Vec<(String, String)> = mock
            .response
            .iter()
            .flat_map(|r| r.headers.iter())
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect();

        ctx.logger.log(
            session.id,
            RequestLog::single(
                MessageType::Mocked,
                format!("{} {}", status.as_u16(), mock.request.url),
            )
            .with_plugin(PLUGIN_NAME),
        );

        match self.resolve_body(&snapshot.compiled[idx].body, session, ctx).await {
            ResolvedBody::Json(value) => ResponseBuilder::send_json(session, status, headers, &value),
            ResolvedBody::Raw(bytes) => ResponseBuilder::send_raw(session, status, headers, bytes),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use http::HeaderMap;

    use super::*;
    use crate::{core::{RequestData, SharedState}, logging::RequestLogger};

    fn get_context() -> ProxyContext {
        ProxyContext {
            state: Arc::new(SharedState::new()),
            logger: Arc::new(RequestLogger::new(false)),
            watch: Arc::new(WatchSet::from_specs(&["https://*"]).unwrap()),
            app_folder: PathBuf::from("."),
        }
    }

    fn get_session(method: Method, url: &str) -> Session {
        Session::new(
            1,
            RequestData::new(method, url, HeaderMap::new(), Bytes::new()),
        )
    }

    fn plugin_with_mocks(dir: &std::path::Path, mocks_json: &str) -> PluginMockResponse {
        let path = dir.join("mocks.json");
        std::fs::write(&path, mocks_json).unwrap();
        PluginMockResponse {
            watch: WatchSet::default(),
            loader: FileLoader::new(path),
            nth_counters: DashMap::new(),
            counters_generation: Mutex::new(0),
        }
    }

    #[tokio::test]
    async fn test_first_matching_mock_wins() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/me" }, "response": { "body": { "id": "first" } } },
    { "request": { "url": "/v1.0/me" }, "response": { "body": { "id": "second" } } }
  ]
}"#,
        );

        let ctx = get_context();
        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert!(session.response_state.has_been_set);
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["id"], "first");
    }

    #[tokio::test]
    async fn test_method_filter() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/me", "method": "POST" }, "response": { "statusCode": 201 } }
  ]
}"#,
        );

        let ctx = get_context();
        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(!session.response_state.has_been_set);

        let mut session = get_session(Method::POST, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert_eq!(session.response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_wildcard_match() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "https://graph.microsoft.com/v1.0/users/*" },
      "response": { "body": { "id": "u" } } }
  ]
}"#,
        );

        let ctx = get_context();
        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/users/42");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(session.response_state.has_been_set);

        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/groups/42");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(!session.response_state.has_been_set);
    }

    #[tokio::test]
    async fn test_nth_fires_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/users/*", "nth": 2 },
      "response": { "statusCode": 200, "body": { "id": "u" } } }
  ]
}"#,
        );
        let ctx = get_context();

        // First match counts but does not fire.
        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/users/42");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(!session.response_state.has_been_set);

        // Second match fires.
        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/users/42");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(session.response_state.has_been_set);
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["id"], "u");

        // Third match is exhausted.
        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/users/42");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(!session.response_state.has_been_set);
    }

    #[tokio::test]
    async fn test_nth_rule_is_passed_over_for_later_rules() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/me", "nth": 2 }, "response": { "body": { "id": "nth" } } },
    { "request": { "url": "/v1.0/me" }, "response": { "body": { "id": "fallback" } } }
  ]
}"#,
        );
        let ctx = get_context();

        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["id"], "fallback");

        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["id"], "nth");
    }

    #[tokio::test]
    async fn test_identical_requests_without_nth_get_identical_responses() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/me" },
      "response": { "statusCode": 200, "body": { "id": "stable" } } }
  ]
}"#,
        );
        let ctx = get_context();

        let mut first = get_session(Method::GET, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut first, &ctx).await.unwrap();
        let mut second = get_session(Method::GET, "https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut second, &ctx).await.unwrap();

        assert_eq!(first.response.status, second.response.status);
        assert_eq!(first.response.body, second.response.body);
    }

    #[tokio::test]
    async fn test_file_body_served_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("payloads")).unwrap();
        std::fs::write(dir.path().join("payloads/a.bin"), b"\x00\x01binary").unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/photo" },
      "response": {
        "headers": [{ "name": "Content-Type", "value": "application/octet-stream" }],
        "body": "@payloads/a.bin"
      } }
  ]
}"#,
        );
        let ctx = get_context();

        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/photo");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert_eq!(&session.response.body[..], b"\x00\x01binary");
        assert_eq!(
            session.response.headers.get("content-type").unwrap(),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_missing_file_body_falls_back_to_literal() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_with_mocks(
            dir.path(),
            r#"{
  "mocks": [
    { "request": { "url": "/v1.0/photo" }, "response": { "body": "@payloads/missing.bin" } }
  ]
}"#,
        );
        let ctx = get_context();

        let mut session = get_session(Method::GET, "https://graph.microsoft.com/v1.0/photo");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert!(session.response_state.has_been_set);
        assert_eq!(&session.response.body[..], b"@payloads/missing.bin");
    }

    #[test]
    fn test_mocks_file_roundtrip() {
        let text = r#"{
  "mocks": [
    { "request": { "url": "/v1.0/users/*", "method": "GET", "nth": 2 },
      "response": { "statusCode": 200, "body": { "id": "u" } } }
  ]
}"#;
        let parsed = MocksFile::from_json(text).unwrap();
        let serialized = serde_json::to_string(&parsed).unwrap();
        let reparsed = MocksFile::from_json(&serialized).unwrap();
        assert_eq!(reparsed.mocks.len(), 1);
        assert_eq!(reparsed.mocks[0].request.nth, Some(2));
        assert_eq!(reparsed.mocks[0].request.method, Method::GET);
        assert_eq!(
            reparsed.mocks[0].response.as_ref().unwrap().status_code,
            200
        );
    }

    #[test]
    fn test_nth_zero_is_rejected() {
        let text = r#"{ "mocks": [ { "request": { "url": "/a", "nth": 0 } } ] }"#;
        assert!(MocksFile::from_json(text).is_err());
    }
}
