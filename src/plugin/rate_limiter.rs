//! Rate limiting simulation
//!
//! Keeps a per-process resource budget over a sliding reset window. Every
//! in-scope request costs a fixed amount; crossing the warning threshold
//! annotates real responses with the limit/remaining/reset triplet, and an
//! exhausted budget answers with a throttled 429 or the user's custom
//! response until the window resets.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use http::{HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::{
        loader::{FileLoader, LoadableConfig},
        resolve_config_path,
    },
    core::{
        request_guard, url_in_scope, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, Session,
        ThrottlerInfo, ThrottlingInfo, WatchSet,
    },
    logging::{MessageType, RequestLog},
    plugin::mock_response::MockResponseSpec,
    utils::{msgraph, request::throttle_key, response::ResponseBuilder},
};

pub const PLUGIN_NAME: &str = "rate-limiter";

/// Session-data key carrying the headers to add to the real response.
const HEADERS_KEY: &str = "rate-limiter:headers";

/// Sentinel value in the custom response meaning "seconds until the
/// current window resets".
const DYNAMIC_RETRY_AFTER: &str = "@dynamic";

/// Creates a Rate Limiter plugin instance with the given configuration.
pub fn create_rate_limiter_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    let custom_response = match config.when_limit_exceeded {
        LimitBehavior::Custom => Some(FileLoader::new(resolve_config_path(
            &config.custom_response_file,
            &ctx.app_folder,
        ))),
        LimitBehavior::Throttle => None,
    };

    Ok(Arc::new(PluginRateLimiter {
        state: Mutex::new(RateLimiterState::new(&config)),
        config,
        watch,
        custom_response,
    }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum LimitBehavior {
    /// Respond 429 and register a throttler for the rest of the window.
    #[default]
    Throttle,
    /// Respond with the configured custom response file.
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ResetFormat {
    /// Seconds left until the window resets.
    #[default]
    SecondsLeft,
    /// Absolute reset time as UTC epoch seconds.
    UtcEpochSeconds,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    header_limit: String,
    header_remaining: String,
    header_reset: String,
    header_retry_after: String,

    #[validate(range(min = 1))]
    cost_per_request: i64,

    #[validate(range(min = 1))]
    reset_time_window_seconds: u64,

    #[validate(range(min = 0, max = 100))]
    warning_threshold_percent: i64,

    #[validate(range(min = 1))]
    rate_limit: i64,

    when_limit_exceeded: LimitBehavior,
    reset_format: ResetFormat,
    custom_response_file: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            header_limit: "RateLimit-Limit".to_string(),
            header_remaining: "RateLimit-Remaining".to_string(),
            header_reset: "RateLimit-Reset".to_string(),
            header_retry_after: "Retry-After".to_string(),
            cost_per_request: 2,
            reset_time_window_seconds: 60,
            warning_threshold_percent: 80,
            rate_limit: 120,
            when_limit_exceeded: LimitBehavior::default(),
            reset_format: ResetFormat::default(),
            custom_response_file: "rate-limit-response.json".to_string(),
        }
    }
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::serialization_error("Invalid rate limiter plugin config", e))?;
        config.validate()?;
        Ok(config)
    }
}

/// The custom `rate-limit-response.json` shape: a bare mock response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitResponseFile(pub MockResponseSpec);

impl LoadableConfig for RateLimitResponseFile {
    const KIND: &'static str = "rate limit response";

    fn from_json(text: &str) -> ProxyResult<Self> {
        serde_json::from_str(text).map_err(ProxyError::from)
    }

    fn empty() -> Self {
        Self(MockResponseSpec {
            status_code: 429,
            headers: Vec::new(),
            body: None,
        })
    }
}

/// Mutable window state. Both counters reset together before the current
/// request is accounted, so `0 <= resources_remaining <= rate_limit` holds
/// at rest.
struct RateLimiterState {
    resources_remaining: i64,
    reset_at: Instant,
    reset_at_epoch: u64,
}

impl RateLimiterState {
    fn new(config: &PluginConfig) -> Self {
        let now = Instant::now();
        Self {
            resources_remaining: config.rate_limit,
            reset_at: now + Duration::from_secs(config.reset_time_window_seconds),
            reset_at_epoch: epoch_seconds_in(config.reset_time_window_seconds),
        }
    }
}

fn epoch_seconds_in(seconds: u64) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        + seconds
}

/// Outcome of accounting one request against the window.
struct Accounting {
    remaining: i64,
    exceeded: bool,
    reset_value: u64,
    seconds_until_reset: u64,
    reset_at: Instant,
}

pub struct PluginRateLimiter {
    config: PluginConfig,
    watch: WatchSet,
    state: Mutex<RateLimiterState>,
    custom_response: Option<Arc<FileLoader<RateLimitResponseFile>>>,
}

impl PluginRateLimiter {
    fn account(&self) -> Accounting {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if now >= state.reset_at {
            state.resources_remaining = self.config.rate_limit;
            state.reset_at = now + Duration::from_secs(self.config.reset_time_window_seconds);
            state.reset_at_epoch = epoch_seconds_in(self.config.reset_time_window_seconds);
        }

        state.resources_remaining -= self.config.cost_per_request;
        let exceeded = state.resources_remaining < 0;
        if exceeded {
            state.resources_remaining = 0;
        }

        let seconds_until_reset = state.reset_at.saturating_duration_since(now).as_secs();
        let reset_value = match self.config.reset_format {
            ResetFormat::SecondsLeft => seconds_until_reset,
            ResetFormat::UtcEpochSeconds => state.reset_at_epoch,
        };

        Accounting {
            remaining: state.resources_remaining,
            exceeded,
            reset_value,
            seconds_until_reset,
            reset_at: state.reset_at,
        }
    }

    fn limit_headers(&self, accounting: &Accounting) -> Vec<(String, String)> {
        vec![
            (self.config.header_limit.clone(), self.config.rate_limit.to_string()),
            (
                self.config.header_remaining.clone(),
                accounting.remaining.to_string(),
            ),
            (self.config.header_reset.clone(), accounting.reset_value.to_string()),
        ]
    }

    fn register_throttler(&self, session: &Session, ctx: &ProxyContext, reset_at: Instant) {
        let key = throttle_key(&session.request);
        let window = reset_at.saturating_duration_since(Instant::now());
        ctx.state.push_throttler(ThrottlerInfo::new(
            key,
            window,
            Box::new(move |request, key| {
                let seconds = reset_at
                    .saturating_duration_since(Instant::now())
                    .as_secs();
                if seconds > 0 && throttle_key(request) == key {
                    ThrottlingInfo {
                        throttle_for_seconds: seconds,
                        retry_after_header_name: "Retry-After".to_string(),
                    }
                } else {
                    ThrottlingInfo::none()
                }
            }),
        ));
    }

    fn send_throttled(&self, session: &mut Session, accounting: &Accounting) {
        let retry_after = accounting.seconds_until_reset.max(1).to_string();
        if msgraph::is_graph_request(session) {
            let request_id = Uuid::new_v4();
            let mut headers = msgraph::error_headers(session, request_id);
            headers.push((self.config.header_retry_after.clone(), retry_after));
            ResponseBuilder::send_json(
                session,
                StatusCode::TOO_MANY_REQUESTS,
                headers,
                &msgraph::error_body(StatusCode::TOO_MANY_REQUESTS, request_id),
            );
        } else {
            ResponseBuilder::send_json(
                session,
                StatusCode::TOO_MANY_REQUESTS,
                vec![(self.config.header_retry_after.clone(), retry_after)],
                &json!({"message": "Too Many Requests"}),
            );
        }
    }

    fn send_custom(&self, session: &mut Session, accounting: &Accounting) {
        let snapshot = match self.custom_response {
            Some(ref loader) => loader.snapshot(),
            None => Arc::new(RateLimitResponseFile::empty()),
        };
        let spec = &snapshot.0;

        let status = StatusCode::from_u16(spec.status_code)
            .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
        let headers: Vec<(String, String)> = spec
            .headers
            .iter()
            .map(|h| {
                let value = if h.value == DYNAMIC_RETRY_AFTER
                    && h.name.eq_ignore_ascii_case(&self.config.header_retry_after)
                {
                    accounting.seconds_until_reset.max(1).to_string()
                } else {
                    h.value.clone()
                };
                (h.name.clone(), value)
            })
            .collect();
        let body = spec.body.clone().unwrap_or(JsonValue::Null);

        ResponseBuilder::send_json(session, status, headers, &body);
    }
}

#[async_trait]
impl ProxyPlugin for PluginRateLimiter {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn init(&self, _ctx: &ProxyContext) -> ProxyResult<()> {
        if let Some(ref loader) = self.custom_response {
            loader.init_watcher()?;
        }
        Ok(())
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let accounting = self.account();

        if !accounting.exceeded {
            let warning_floor = self.config.rate_limit
                * (100 - self.config.warning_threshold_percent)
                / 100;
            if accounting.remaining <= warning_floor {
                session.set(HEADERS_KEY, self.limit_headers(&accounting));
            }
            return Ok(());
        }

        ctx.logger.log(
            session.id,
            RequestLog::single(
                MessageType::Chaos,
                format!(
                    "Exceeded resource limit when calling {}. Request will be throttled.",
                    session.request.url
                ),
            )
            .with_plugin(PLUGIN_NAME),
        );

        match self.config.when_limit_exceeded {
            LimitBehavior::Throttle => {
                self.register_throttler(session, ctx, accounting.reset_at);
                self.send_throttled(session, &accounting);
            }
            LimitBehavior::Custom => self.send_custom(session, &accounting),
        }

        Ok(())
    }

    async fn before_response(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !url_in_scope(&self.watch, session, ctx) {
            return Ok(());
        }
        let Some(headers) = session.get::<Vec<(String, String)>>(HEADERS_KEY) else {
            return Ok(());
        };

        for (name, value) in headers.clone() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                continue;
            };
            session.response.headers.insert(name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use serde_json::json;

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

    fn get_plugin(cfg: JsonValue) -> PluginRateLimiter {
        let config = PluginConfig::try_from(cfg).unwrap();
        PluginRateLimiter {
            state: Mutex::new(RateLimiterState::new(&config)),
            config,
            watch: WatchSet::default(),
            custom_response: None,
        }
    }

    #[tokio::test]
    async fn test_budget_is_spent_and_clamped() {
        let ctx = get_context();
        let plugin = get_plugin(json!({
            "rateLimit": 10,
            "costPerRequest": 2,
            "resetTimeWindowSeconds": 60
        }));

        // Five requests drain the budget exactly to zero.
        for _ in 0..5 {
            let mut session = get_session("https://example.com/api");
            plugin.before_request(&mut session, &ctx).await.unwrap();
            assert!(!session.response_state.has_been_set);
        }
        assert_eq!(plugin.state.lock().unwrap().resources_remaining, 0);

        // The sixth request is rejected and the counter stays clamped.
        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(session.response_state.has_been_set);
        assert_eq!(session.response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(plugin.state.lock().unwrap().resources_remaining, 0);
    }

    #[tokio::test]
    async fn test_window_reset_restores_budget() {
        let ctx = get_context();
        let plugin = get_plugin(json!({
            "rateLimit": 2,
            "costPerRequest": 2,
            "resetTimeWindowSeconds": 1
        }));

        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(session.response_state.has_been_set);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        assert!(!session.response_state.has_been_set);
    }

    #[tokio::test]
    async fn test_warning_threshold_annotates_real_response() {
        let ctx = get_context();
        let plugin = get_plugin(json!({
            "rateLimit": 10,
            "costPerRequest": 2,
            "warningThresholdPercent": 50
        }));

        // First two requests sit above the 50% floor: no annotation.
        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        plugin.before_response(&mut session, &ctx).await.unwrap();
        assert!(session.response.headers.get("RateLimit-Remaining").is_none());

        // Third request crosses it (remaining 4 <= floor 5).
        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        let mut session2 = get_session("https://example.com/api");
        plugin.before_request(&mut session2, &ctx).await.unwrap();
        plugin.before_response(&mut session2, &ctx).await.unwrap();
        assert_eq!(
            session2.response.headers.get("RateLimit-Limit").unwrap(),
            "10"
        );
        assert_eq!(
            session2.response.headers.get("RateLimit-Remaining").unwrap(),
            "4"
        );
        assert!(session2.response.headers.get("RateLimit-Reset").is_some());
    }

    #[tokio::test]
    async fn test_throttle_mode_registers_throttler() {
        let ctx = get_context();
        let plugin = get_plugin(json!({
            "rateLimit": 2,
            "costPerRequest": 2,
            "resetTimeWindowSeconds": 60
        }));

        let mut session = get_session("https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        let mut session = get_session("https://graph.microsoft.com/v1.0/me");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert_eq!(session.response.status, StatusCode::TOO_MANY_REQUESTS);
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["error"]["code"], "Too Many Requests");

        let throttlers = ctx.state.throttlers();
        assert_eq!(throttlers.len(), 1);
        let info = (throttlers[0].should_throttle)(&session.request, &throttlers[0].throttling_key);
        assert!(info.throttle_for_seconds > 0);
    }

    #[tokio::test]
    async fn test_custom_response_with_dynamic_retry_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate-limit-response.json");
        std::fs::write(
            &path,
            r#"{
  "statusCode": 429,
  "headers": [{ "name": "Retry-After", "value": "@dynamic" }],
  "body": { "message": "Custom throttled" }
}"#,
        )
        .unwrap();

        let ctx = get_context();
        let config = PluginConfig::try_from(json!({
            "rateLimit": 2,
            "costPerRequest": 2,
            "resetTimeWindowSeconds": 60,
            "whenLimitExceeded": "custom"
        }))
        .unwrap();
        let plugin = PluginRateLimiter {
            state: Mutex::new(RateLimiterState::new(&config)),
            config,
            watch: WatchSet::default(),
            custom_response: Some(FileLoader::new(&path)),
        };

        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();
        let mut session = get_session("https://example.com/api");
        plugin.before_request(&mut session, &ctx).await.unwrap();

        assert_eq!(session.response.status, StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = session
            .response
            .headers
            .get("Retry-After")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
        let body: JsonValue = serde_json::from_slice(&session.response.body).unwrap();
        assert_eq!(body["message"], "Custom throttled");
    }
}
