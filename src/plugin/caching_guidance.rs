//! Caching guidance
//!
//! Warns when the client re-requests the same URL inside the configured
//! interval: the response was likely cacheable and the client should not
//! have gone back to the network. The recently-seen cache is a shared
//! per-URL slot so it survives the session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::{
    core::{request_guard, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, Session, WatchSet},
    logging::{MessageType, RequestLog},
};

pub const PLUGIN_NAME: &str = "caching-guidance";

/// Creates a Caching Guidance plugin instance with the given configuration.
pub fn create_caching_guidance_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    _ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    Ok(Arc::new(PluginCachingGuidance { config, watch }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    #[validate(range(min = 1))]
    cache_threshold_seconds: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            cache_threshold_seconds: 5,
        }
    }
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value).map_err(|e| {
            ProxyError::serialization_error("Invalid caching guidance plugin config", e)
        })?;
        config.validate()?;
        Ok(config)
    }
}

type SeenRequests = Mutex<HashMap<String, Instant>>;

pub struct PluginCachingGuidance {
    config: PluginConfig,
    watch: WatchSet,
}

#[async_trait]
impl ProxyPlugin for PluginCachingGuidance {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let seen = ctx
            .state
            .global_or_insert_with::<SeenRequests, _>(PLUGIN_NAME, || Mutex::new(HashMap::new()));
        let now = Instant::now();
        let threshold = Duration::from_secs(self.config.cache_threshold_seconds);

        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = seen.get(&session.request.url) {
            if now.duration_since(*last) < threshold {
                ctx.logger.log(
                    session.id,
                    RequestLog::new(
                        MessageType::Tip,
                        vec![
                            format!(
                                "The same request was issued {}s ago.",
                                now.duration_since(*last).as_secs()
                            ),
                            "Consider caching the response to improve performance.".to_string(),
                        ],
                    )
                    .with_plugin(PLUGIN_NAME),
                );
            }
        }
        seen.insert(session.request.url.clone(), now);

        Ok(())
    }
}
