//! Execution summary
//!
//! When recording stops, condenses the recorded request logs into a JSON
//! summary, publishes it to the shared reports bag, and writes it to disk.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use validator::Validate;

use crate::{
    config::resolve_config_path,
    core::{ProxyContext, ProxyError, ProxyPlugin, ProxyResult, WatchSet},
    logging::{MessageType, RequestLog},
};

pub const PLUGIN_NAME: &str = "execution-summary";

/// Creates an Execution Summary plugin instance with the given configuration.
pub fn create_execution_summary_plugin(
    cfg: JsonValue,
    _watch: WatchSet,
    _ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    Ok(Arc::new(PluginExecutionSummary { config }))
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    #[validate(length(min = 1))]
    summary_file: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            summary_file: "devproxy-summary.json".to_string(),
        }
    }
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value).map_err(|e| {
            ProxyError::serialization_error("Invalid execution summary plugin config", e)
        })?;
        config.validate()?;
        Ok(config)
    }
}

pub struct PluginExecutionSummary {
    config: PluginConfig,
}

fn message_type_key(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::InterceptedRequest => "intercepted",
        MessageType::InterceptedResponse => "apiResponses",
        MessageType::PassedThrough => "passedThrough",
        MessageType::Chaos => "chaos",
        MessageType::Warning => "warnings",
        MessageType::Mocked => "mocked",
        MessageType::Failed => "failed",
        MessageType::Tip => "tips",
        MessageType::Skipped => "skipped",
        MessageType::FinishedProcessingRequest => "requests",
    }
}

fn build_summary(logs: &[RequestLog]) -> JsonValue {
    let mut counts = serde_json::Map::new();
    let mut requests = Vec::new();

    for record in logs {
        let key = message_type_key(record.message_type);
        let entry = counts.entry(key.to_string()).or_insert(json!(0));
        if let Some(n) = entry.as_u64() {
            *entry = json!(n + 1);
        }

        if record.message_type == MessageType::FinishedProcessingRequest {
            requests.push(json!({
                "method": record.method,
                "url": record.url,
            }));
        }
    }

    json!({
        "totals": counts,
        "requests": requests,
    })
}

#[async_trait]
impl ProxyPlugin for PluginExecutionSummary {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn after_recording_stop(
        &self,
        logs: &[RequestLog],
        ctx: &ProxyContext,
    ) -> ProxyResult<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let summary = build_summary(logs);
        ctx.state.insert_report(PLUGIN_NAME, summary.clone());

        let path = resolve_config_path(&self.config.summary_file, &ctx.app_folder);
        let path = if path.is_relative() {
            ctx.app_folder.join(path)
        } else {
            path
        };
        let text = serde_json::to_string_pretty(&summary)?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| ProxyError::Internal(format!("Cannot write summary file: {e}")))?;
        log::info!("Wrote execution summary to {}", path.display());

        Ok(())
    }
}
