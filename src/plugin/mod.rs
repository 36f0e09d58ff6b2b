pub mod caching_guidance;
pub mod crud_api;
pub mod execution_summary;
pub mod latency;
pub mod mock_response;
pub mod odata_paging_guidance;
pub mod random_error;
pub mod rate_limiter;
pub mod retry_after;

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;

use crate::{
    config::AppConfig,
    core::{PluginCreateFn, PluginExecutor, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, WatchSet},
};

/// Global registry mapping plugin names to their factory functions.
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (
            retry_after::PLUGIN_NAME,
            retry_after::create_retry_after_plugin,
        ),
        (
            random_error::PLUGIN_NAME,
            random_error::create_random_error_plugin,
        ),
        (latency::PLUGIN_NAME, latency::create_latency_plugin),
        (
            mock_response::PLUGIN_NAME,
            mock_response::create_mock_response_plugin,
        ),
        (
            rate_limiter::PLUGIN_NAME,
            rate_limiter::create_rate_limiter_plugin,
        ),
        (crud_api::PLUGIN_NAME, crud_api::create_crud_api_plugin),
        (
            caching_guidance::PLUGIN_NAME,
            caching_guidance::create_caching_guidance_plugin,
        ),
        (
            odata_paging_guidance::PLUGIN_NAME,
            odata_paging_guidance::create_odata_paging_guidance_plugin,
        ),
        (
            execution_summary::PLUGIN_NAME,
            execution_summary::create_execution_summary_plugin,
        ),
    ];
    arr.into_iter().collect()
});

/// Builds a plugin instance based on its name and configuration.
///
/// # Arguments
/// - `name`: Plugin identifier (must match registry keys)
/// - `cfg`: The plugin's config section as JSON
/// - `watch`: The plugin's own watch list; empty falls back to the global one
///
/// # Errors
/// Unknown plugin names and invalid configuration sections fail fast so a
/// typo in the config file is caught at startup, not mid-traffic.
pub fn build_plugin(
    name: &str,
    cfg: JsonValue,
    watch: WatchSet,
    ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| ProxyError::Configuration(format!("Unknown plugin type '{name}'")))?;
    builder(cfg, watch, ctx)
}

/// Builds the plugin chain from the main configuration, preserving
/// declaration order.
pub fn build_plugin_executor(config: &AppConfig, ctx: &ProxyContext) -> ProxyResult<PluginExecutor> {
    let mut plugins: Vec<Arc<dyn ProxyPlugin>> = Vec::new();
    for reference in config.enabled_plugins() {
        if let Some(ref path) = reference.plugin_path {
            log::debug!(
                "Plugin '{}' declares path {path}; resolving by name instead",
                reference.name
            );
        }
        let watch = WatchSet::from_specs(&reference.urls_to_watch)?;
        let section = config.plugin_section(reference);
        let plugin = build_plugin(&reference.name, section, watch, ctx)?;
        log::info!("Loaded plugin '{}'", plugin.name());
        plugins.push(plugin);
    }
    Ok(PluginExecutor::new(plugins))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::{core::SharedState, logging::RequestLogger};

    fn get_context(dir: &std::path::Path) -> ProxyContext {
        ProxyContext {
            state: Arc::new(SharedState::new()),
            logger: Arc::new(RequestLogger::new(false)),
            watch: Arc::new(WatchSet::default()),
            app_folder: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_unknown_plugin_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = get_context(dir.path());
        let result = build_plugin("no-such-plugin", json!({}), WatchSet::default(), &ctx);
        assert!(result.is_err());
    }

    #[test]
    fn test_executor_preserves_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = get_context(dir.path());
        let config = AppConfig::from_json(
            r#"{
  "plugins": [
    { "name": "retry-after" },
    { "name": "random-error", "configSection": "randomError" },
    { "name": "latency", "enabled": false },
    { "name": "mock-response", "configSection": "mocks" }
  ],
  "randomError": { "rate": 50 },
  "mocks": { "mocksFile": "mocks.json" }
}"#,
        )
        .unwrap();

        let executor = build_plugin_executor(&config, &ctx).unwrap();
        let names: Vec<&str> = executor.plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["retry-after", "random-error", "mock-response"]);
    }

    #[test]
    fn test_invalid_section_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = get_context(dir.path());
        let config = AppConfig::from_json(
            r#"{
  "plugins": [ { "name": "random-error", "configSection": "randomError" } ],
  "randomError": { "rate": 250 }
}"#,
        )
        .unwrap();
        assert!(build_plugin_executor(&config, &ctx).is_err());
    }
}
