//! Random error injection
//!
//! Draws against the configured failure rate for every in-scope request
//! and synthesizes a protocol-appropriate error: the Graph envelope for
//! Microsoft Graph destinations, otherwise a response from the
//! hot-reloaded errors file. An injected 429 registers a throttler so
//! retries inside the window keep failing.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::{loader::{FileLoader, LoadableConfig}, resolve_config_path},
    core::{
        request_guard, InvocationContext, ProxyContext, ProxyError, ProxyPlugin, ProxyResult,
        Session, ThrottlerInfo, ThrottlingInfo, WatchSet,
    },
    logging::{MessageType, RequestLog},
    utils::{
        msgraph,
        request::throttle_key,
        response::{retry_after_value, HeaderEntry, ResponseBuilder, RetryAfterFormat},
    },
};

pub const PLUGIN_NAME: &str = "random-error";

/// Creates a Random Error plugin instance with the given configuration.
pub fn create_random_error_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    let errors = config
        .errors_file
        .as_ref()
        .map(|path| FileLoader::new(resolve_config_path(path, &ctx.app_folder)));

    Ok(Arc::new(PluginRandomError {
        rate: AtomicU8::new(config.rate),
        allowed: Mutex::new(config.allowed_errors.clone()),
        config,
        watch,
        errors,
    }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    /// Percentage of in-scope requests to fail (0-100).
    #[validate(range(min = 0, max = 100))]
    rate: u8,

    /// Status codes eligible for injection. Empty means every status the
    /// request method supports.
    allowed_errors: Vec<u16>,

    /// Error responses for non-Graph destinations, hot-reloaded.
    errors_file: Option<String>,

    /// Throttle window attached to injected 429s.
    #[validate(range(min = 1))]
    retry_after_seconds: u64,

    retry_after_format: RetryAfterFormat,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            rate: 50,
            allowed_errors: Vec::new(),
            errors_file: None,
            retry_after_seconds: 5,
            retry_after_format: RetryAfterFormat::default(),
        }
    }
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::serialization_error("Invalid random error plugin config", e))?;
        config.validate()?;
        Ok(config)
    }
}

/// One error shape in the errors file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericErrorResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub add_dynamic_retry_after: bool,
}

/// The hot-reloaded `errors.json` shape.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ErrorsFile {
    #[serde(default)]
    pub errors: Vec<GenericErrorResponse>,
}

impl LoadableConfig for ErrorsFile {
    const KIND: &'static str = "errors";

    fn from_json(text: &str) -> ProxyResult<Self> {
        let parsed: ErrorsFile = serde_json::from_str(text)?;
        for error in &parsed.errors {
            StatusCode::from_u16(error.status_code).map_err(|_| {
                ProxyError::Validation(format!("Invalid error status code {}", error.status_code))
            })?;
        }
        Ok(parsed)
    }

    fn empty() -> Self {
        Self::default()
    }
}

/// Status codes a given method may fail with.
fn method_status_codes(method: &Method) -> &'static [u16] {
    match *method {
        Method::GET | Method::HEAD => &[429, 500, 502, 503, 504],
        _ => &[429, 500, 502, 503, 504, 507],
    }
}

pub struct PluginRandomError {
    config: PluginConfig,
    watch: WatchSet,
    rate: AtomicU8,
    allowed: Mutex<Vec<u16>>,
    errors: Option<Arc<FileLoader<ErrorsFile>>>,
}

impl PluginRandomError {
    fn pick_status(&self, method: &Method) -> Option<StatusCode> {
        let supported = method_status_codes(method);
        let allowed = self.allowed.lock().unwrap_or_else(|e| e.into_inner());
        let pool: Vec<u16> = if allowed.is_empty() {
            supported.to_vec()
        } else {
            supported
                .iter()
                .copied()
                .filter(|code| allowed.contains(code))
                .collect()
        };
        drop(allowed);

        if pool.is_empty() {
            return None;
        }

        // Uniform over the whole pool, last element included.
        let idx = rand::thread_rng().gen_range(0..pool.len());
        StatusCode::from_u16(pool[idx]).ok()
    }

    fn register_throttler(&self, session: &Session, ctx: &ProxyContext) {
        let key = throttle_key(&session.request);
        let window = self.config.retry_after_seconds;
        ctx.state.push_throttler(ThrottlerInfo::new(
            key,
            Duration::from_secs(window),
            Box::new(move |request, key| {
                if throttle_key(request) == key {
                    ThrottlingInfo {
                        throttle_for_seconds: window,
                        retry_after_header_name: "Retry-After".to_string(),
                    }
                } else {
                    ThrottlingInfo::none()
                }
            }),
        ));
    }

    fn send_graph_error(&self, session: &mut Session, status: StatusCode) {
        let request_id = Uuid::new_v4();
        let mut headers = msgraph::error_headers(session, request_id);
        if status == StatusCode::TOO_MANY_REQUESTS {
            headers.push((
                "Retry-After".to_string(),
                retry_after_value(self.config.retry_after_format, self.config.retry_after_seconds),
            ));
        }
        ResponseBuilder::send_json(
            session,
            status,
            headers,
            &msgraph::error_body(status, request_id),
        );
    }

    fn send_generic_error(&self, session: &mut Session, status: StatusCode) {
        let declared = self.errors.as_ref().and_then(|loader| {
            loader
                .snapshot()
                .errors
                .iter()
                .find(|e| e.status_code == status.as_u16())
                .cloned()
        });

        match declared {
            Some(error) => {
                let mut headers: Vec<(String, String)> = error
                    .headers
                    .iter()
                    .map(|h| (h.name.clone(), h.value.clone()))
                    .collect();
                if error.add_dynamic_retry_after {
                    headers.push((
                        "Retry-After".to_string(),
                        retry_after_value(
                            self.config.retry_after_format,
                            self.config.retry_after_seconds,
                        ),
                    ));
                }
                let body = error.body.unwrap_or(JsonValue::Null);
                ResponseBuilder::send_json(session, status, headers, &body);
            }
            None => {
                let mut headers = Vec::new();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    headers.push((
                        "Retry-After".to_string(),
                        retry_after_value(
                            self.config.retry_after_format,
                            self.config.retry_after_seconds,
                        ),
                    ));
                }
                let body = json!({
                    "message": status.canonical_reason().unwrap_or("Error"),
                });
                ResponseBuilder::send_json(session, status, headers, &body);
            }
        }
    }
}

#[async_trait]
impl ProxyPlugin for PluginRandomError {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn init(&self, _ctx: &ProxyContext) -> ProxyResult<()> {
        if let Some(ref loader) = self.errors {
            loader.init_watcher()?;
        }
        Ok(())
    }

    async fn options_loaded(
        &self,
        options: &InvocationContext,
        _ctx: &ProxyContext,
    ) -> ProxyResult<()> {
        if let Some(rate) = options.failure_rate {
            self.rate.store(rate.min(100), Ordering::SeqCst);
        }
        if !options.allowed_errors.is_empty() {
            *self.allowed.lock().unwrap_or_else(|e| e.into_inner()) =
                options.allowed_errors.clone();
        }
        Ok(())
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let rate = self.rate.load(Ordering::SeqCst);
        if rate == 0 {
            return Ok(());
        }
        let roll = rand::thread_rng().gen_range(1..=100);
        if roll > rate {
            return Ok(());
        }

        let Some(status) = self.pick_status(&session.request.method) else {
            return Ok(());
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.register_throttler(session, ctx);
        }

        ctx.logger.log(
            session.id,
            RequestLog::single(MessageType::Chaos, status.to_string()).with_plugin(PLUGIN_NAME),
        );

        if msgraph::is_graph_request(session) {
            self.send_graph_error(session, status);
        } else {
            self.send_generic_error(session, status);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;
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

    fn get_session(url: &str) -> Session {
        Session::new(
            1,
            RequestData::new(Method::GET, url, HeaderMap::new(), Bytes::new()),
        )
    }

    fn get_plugin(cfg: JsonValue) -> PluginRandomError {
        let config = PluginConfig::try_from(cfg).unwrap();
        PluginRandomError {
            rate: AtomicU8::new(config.rate),
            allowed: Mutex::new(config.allowed_errors.clone()),
            config,
            watch: WatchSet::default(),
            errors: None,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = PluginConfig::try_from(json!({})).unwrap();
        assert_eq!(config.rate, 50);
        assert_eq!(config.retry_after_seconds, 5);
        assert!(config.allowed_errors.is_empty());
    }

    #[test]
    fn test_config_rejects_rate_above_100() {
        assert!(PluginConfig::try_from(json!({"rate": 101})).is_err());
    }

    #[tokio::test]
    async fn test_rate_zero_never_injects() {
        let ctx = get_context();
        let plugin = get_plugin(json!({"rate": 0}));
        for _ in 0..50 {
            let mut session = get_session("https://example.com/api");
            plugin.before_request(&mut session, &ctx).await.unwrap();
            assert!(!session.response_state.has_been_set);
        }
    }

    #[tokio::test]
    async fn test_rate_hundred_always_injects() {
        let ctx = get_context();
        let plugin = get_plugin(json!({"rate": 100}));
        for _ in 0..50 {
            let mut session = get_session("https://example.com/api");
            plugin.before_request(&mut session, &ctx).await.unwrap();
            assert!(session.response_state.has_been_set);
            assert!(session.response.status.is_server_error()
                || session.response.status == StatusCode::TOO_MANY_REQUESTS);
        }
    }

    #[tokio::test]
    async fn test_single_allowed_status_is_pickable() {
        // A one-element pool must still be drawable; guards against an
        // exclusive upper bound dropping the last element.
        let ctx = get_context();
        let plugin = get_plugin(json!({"rate": 100, "allowedErrors": [503]}));
        for _ in 0..20 {
            let mut session = get_session("https://example.com/api");
            plugin.before_request(&mut session, &ctx).await.unwrap();
            assert_eq!(session.response.status, StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[tokio::test]
    async fn test_injected_429_registers_throttler() {
        let ctx = get_context();
        let plugin = get_plugin(json!({"rate": 100, "allowedErrors": [429]}));
        let mut session = get_session("https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert_eq!(session.response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(session.response.headers.get("Retry-After").unwrap(), "5");

        let throttlers = ctx.state.throttlers();
        assert_eq!(throttlers.len(), 1);
        assert_eq!(throttlers[0].throttling_key, "graph.microsoft.com/v1.0/me");

        // Consulting the registered throttler with the same request shape
        // reports the remaining window.
        let info = (throttlers[0].should_throttle)(&session.request, &throttlers[0].throttling_key);
        assert_eq!(info.throttle_for_seconds, 5);
    }

    #[tokio::test]
    async fn test_graph_destination_gets_envelope() {
        let ctx = get_context();
        let plugin = get_plugin(json!({"rate": 100, "allowedErrors": [503]}));
        let mut session = get_session("https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["error"]["code"], "Service Unavailable");
        assert!(session.response.headers.get("request-id").is_some());
    }

    #[tokio::test]
    async fn test_errors_file_body_used_for_other_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.json");
        std::fs::write(
            &path,
            r#"{
  "errors": [
    {
      "statusCode": 503,
      "headers": [{ "name": "X-Source", "value": "errors-file" }],
      "body": { "error": "service down" }
    }
  ]
}"#,
        )
        .unwrap();

        let ctx = get_context();
        let config = PluginConfig::try_from(json!({"rate": 100, "allowedErrors": [503]})).unwrap();
        let plugin = PluginRandomError {
            rate: AtomicU8::new(config.rate),
            allowed: Mutex::new(config.allowed_errors.clone()),
            config,
            watch: WatchSet::default(),
            errors: Some(FileLoader::new(&path)),
        };

        let mut session = get_session("https://api.contoso.com/v2/orders");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert_eq!(session.response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(session.response.headers.get("X-Source").unwrap(), "errors-file");
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["error"], "service down");
    }

    #[tokio::test]
    async fn test_cli_overrides() {
        let ctx = get_context();
        let plugin = get_plugin(json!({"rate": 0}));
        let options = InvocationContext {
            failure_rate: Some(100),
            allowed_errors: vec![502],
            ..Default::default()
        };
        plugin.options_loaded(&options, &ctx).await.unwrap();

        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert_eq!(session.response.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_errors_file_roundtrip() {
        let text = r#"{
  "errors": [
    { "statusCode": 429, "addDynamicRetryAfter": true, "body": { "message": "slow down" } }
  ]
}"#;
        let parsed = ErrorsFile::from_json(text).unwrap();
        let serialized = serde_json::to_string(&parsed).unwrap();
        let reparsed = ErrorsFile::from_json(&serialized).unwrap();
        assert_eq!(reparsed.errors.len(), 1);
        assert_eq!(reparsed.errors[0].status_code, 429);
        assert!(reparsed.errors[0].add_dynamic_retry_after);
    }

    #[test]
    fn test_errors_file_rejects_bad_status() {
        assert!(ErrorsFile::from_json(r#"{ "errors": [ { "statusCode": 99 } ] }"#).is_err());
    }
}
