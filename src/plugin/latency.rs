//! Artificial latency
//!
//! Delays in-scope requests by a uniform random duration from the
//! configured range before the rest of the chain runs.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::{
    core::{request_guard, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, Session, WatchSet},
    logging::{MessageType, RequestLog},
};

pub const PLUGIN_NAME: &str = "latency";

/// Creates a Latency plugin instance with the given configuration.
pub fn create_latency_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    _ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    Ok(Arc::new(PluginLatency { config, watch }))
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    /// Lower bound of the injected delay in milliseconds.
    min_ms: u64,

    /// Upper bound of the injected delay in milliseconds.
    max_ms: u64,
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::serialization_error("Invalid latency plugin config", e))?;
        config.validate()?;
        if config.min_ms > config.max_ms {
            return Err(ProxyError::Validation(
                "minMs must not exceed maxMs".to_string(),
            ));
        }
        Ok(config)
    }
}

pub struct PluginLatency {
    config: PluginConfig,
    watch: WatchSet,
}

impl PluginLatency {
    fn sample_delay(&self) -> Duration {
        if self.config.max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(self.config.min_ms..=self.config.max_ms);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl ProxyPlugin for PluginLatency {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let delay = self.sample_delay();
        if delay.is_zero() {
            return Ok(());
        }

        ctx.logger.log(
            session.id,
            RequestLog::single(
                MessageType::Chaos,
                format!("Delaying request for {}ms", delay.as_millis()),
            )
            .with_plugin(PLUGIN_NAME),
        );
        tokio::time::sleep(delay).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_config_rejects_inverted_range() {
        assert!(PluginConfig::try_from(json!({"minMs": 200, "maxMs": 100})).is_err());
    }

    #[test]
    fn test_sample_within_range() {
        let plugin = PluginLatency {
            config: PluginConfig::try_from(json!({"minMs": 10, "maxMs": 20})).unwrap(),
            watch: WatchSet::default(),
        };
        for _ in 0..100 {
            let delay = plugin.sample_delay().as_millis() as u64;
            assert!((10..=20).contains(&delay));
        }
    }

    #[test]
    fn test_zero_config_means_no_delay() {
        let plugin = PluginLatency {
            config: PluginConfig::default(),
            watch: WatchSet::default(),
        };
        assert!(plugin.sample_delay().is_zero());
    }
}
