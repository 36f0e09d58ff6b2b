//! Retry-After enforcement
//!
//! Runs first in the chain. Consults the shared throttler list and rejects
//! requests that retry inside a throttle window, extending the window on
//! every premature retry so a brute-forcing client never gets through.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;
use validator::Validate;

use crate::{
    core::{
        request_guard, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, Session,
        ThrottlingInfo, WatchSet,
    },
    logging::{MessageType, RequestLog},
    utils::{
        msgraph,
        response::{retry_after_value, ResponseBuilder, RetryAfterFormat},
    },
};

pub const PLUGIN_NAME: &str = "retry-after";

/// Creates a Retry-After plugin instance with the given configuration.
pub fn create_retry_after_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    _ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    Ok(Arc::new(PluginRetryAfter { config, watch }))
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    retry_after_format: RetryAfterFormat,
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::serialization_error("Invalid retry-after plugin config", e))?;
        config.validate()?;
        Ok(config)
    }
}

pub struct PluginRetryAfter {
    config: PluginConfig,
    watch: WatchSet,
}

#[async_trait]
impl ProxyPlugin for PluginRetryAfter {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let now = Instant::now();
        ctx.state.reap_expired_throttlers(now);

        let hit = {
            let mut throttlers = ctx.state.throttlers();
            let mut hit: Option<ThrottlingInfo> = None;
            for throttler in throttlers.iter_mut() {
                let info = (throttler.should_throttle)(&session.request, &throttler.throttling_key);
                if info.throttle_for_seconds > 0 {
                    // Premature retry: push the window out again.
                    throttler.reset_time = now + Duration::from_secs(info.throttle_for_seconds);
                    hit = Some(info);
                    break;
                }
            }
            hit
        };

        let Some(info) = hit else {
            return Ok(());
        };

        ctx.logger.log(
            session.id,
            RequestLog::single(
                MessageType::Failed,
                format!(
                    "Calling {} again before waiting for the Retry-After period. Request will be throttled.",
                    session.request.url
                ),
            )
            .with_plugin(PLUGIN_NAME),
        );

        let retry_value = retry_after_value(self.config.retry_after_format, info.throttle_for_seconds);
        let request_id = Uuid::new_v4();

        if msgraph::is_graph_request(session) {
            let mut headers = msgraph::error_headers(session, request_id);
            headers.push((info.retry_after_header_name, retry_value));
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
                vec![(info.retry_after_header_name, retry_value)],
                &json!({"message": "Too Many Requests"}),
            );
        }

        Ok(())
    }
}
