//! Plugin interface and dispatch
//!
//! Events are the default-implemented methods of [`ProxyPlugin`];
//! overriding one is subscribing to it. The [`PluginExecutor`] awaits each
//! subscriber sequentially in configuration order. A handler error never
//! propagates through dispatch: it is logged and the next subscriber runs.
//! A handler that set the response before failing still counts as a
//! short-circuit.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{
    error::ProxyResult,
    session::Session,
    state::SharedState,
    watch::WatchSet,
};
use crate::logging::{MessageType, RequestLog, RequestLogger};

/// Dependencies threaded from `main` into every plugin.
///
/// There is no global configuration singleton; plugins see exactly this.
pub struct ProxyContext {
    pub state: Arc<SharedState>,
    pub logger: Arc<RequestLogger>,
    /// Global watch list; plugins without their own list fall back to it.
    pub watch: Arc<WatchSet>,
    /// Directory that `~appFolder` config tokens resolve to.
    pub app_folder: PathBuf,
}

/// Parsed command-line invocation handed to plugins after CLI parse.
#[derive(Debug, Default, Clone)]
pub struct InvocationContext {
    pub record: bool,
    pub failure_rate: Option<u8>,
    pub allowed_errors: Vec<u16>,
    pub no_first_run: bool,
}

/// Type alias for plugin factory functions
pub type PluginCreateFn =
    fn(JsonValue, WatchSet, &ProxyContext) -> ProxyResult<Arc<dyn ProxyPlugin>>;

#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Return the name of this plugin
    fn name(&self) -> &str;

    /// Fired once at startup, before the listener starts. Plugins arm
    /// their file watchers and long-lived state here.
    async fn init(&self, _ctx: &ProxyContext) -> ProxyResult<()> {
        Ok(())
    }

    /// Fired once after the command line has been parsed.
    async fn options_loaded(&self, _options: &InvocationContext, _ctx: &ProxyContext) -> ProxyResult<()> {
        Ok(())
    }

    /// Fired for every intercepted request before the upstream fetch.
    ///
    /// A plugin producing a synthetic response calls
    /// [`Session::set_generic_response`]; later subscribers still run and
    /// must no-op through [`request_guard`].
    async fn before_request(&self, _session: &mut Session, _ctx: &ProxyContext) -> ProxyResult<()> {
        Ok(())
    }

    /// Fired after the upstream returned. Not dispatched when the response
    /// was already set by a request-phase plugin.
    async fn before_response(&self, _session: &mut Session, _ctx: &ProxyContext) -> ProxyResult<()> {
        Ok(())
    }

    /// Fired for every session, synthetic or proxied, before the response
    /// bytes are written to the client.
    async fn after_response(&self, _session: &mut Session, _ctx: &ProxyContext) -> ProxyResult<()> {
        Ok(())
    }

    /// Fired once per flushed request-log record.
    async fn after_request_log(&self, _record: &RequestLog, _ctx: &ProxyContext) -> ProxyResult<()> {
        Ok(())
    }

    /// Fired when recording stops, with the recorded logs for the window.
    async fn after_recording_stop(
        &self,
        _logs: &[RequestLog],
        _ctx: &ProxyContext,
    ) -> ProxyResult<()> {
        Ok(())
    }
}

/// Standard request-phase guard shared by every plugin.
///
/// Returns false (and logs why) when the response was already set by an
/// earlier plugin or when the session's URL is outside the plugin's watch
/// list. An empty plugin list falls back to the global one.
pub fn request_guard(
    plugin_name: &str,
    plugin_watch: &WatchSet,
    session: &Session,
    ctx: &ProxyContext,
) -> bool {
    if session.response_state.has_been_set {
        ctx.logger.log(
            session.id,
            RequestLog::single(
                MessageType::Skipped,
                format!("{plugin_name}: response already set"),
            ),
        );
        return false;
    }
    url_in_scope(plugin_watch, session, ctx)
}

/// Scope-only variant of the guard for response-phase handlers, where an
/// already-set response is not a reason to skip.
pub fn url_in_scope(plugin_watch: &WatchSet, session: &Session, ctx: &ProxyContext) -> bool {
    let watch = if plugin_watch.is_empty() {
        &ctx.watch
    } else {
        plugin_watch
    };
    watch.matches(&session.request.url)
}

/// Dispatches events over the configured plugin chain in declaration order.
#[derive(Default)]
pub struct PluginExecutor {
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
}

impl PluginExecutor {
    pub fn new(plugins: Vec<Arc<dyn ProxyPlugin>>) -> Self {
        Self { plugins }
    }

    /// Startup lifecycle events propagate errors: a plugin that cannot
    /// initialize is a fatal configuration problem.
    pub async fn init(&self, ctx: &ProxyContext) -> ProxyResult<()> {
        for plugin in self.plugins.iter() {
            plugin.init(ctx).await?;
        }
        Ok(())
    }

    pub async fn options_loaded(
        &self,
        options: &InvocationContext,
        ctx: &ProxyContext,
    ) -> ProxyResult<()> {
        for plugin in self.plugins.iter() {
            plugin.options_loaded(options, ctx).await?;
        }
        Ok(())
    }

    pub async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) {
        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.before_request(session, ctx).await {
                log::error!("Plugin '{}' failed in before_request: {e}", plugin.name());
            }
        }
    }

    pub async fn before_response(&self, session: &mut Session, ctx: &ProxyContext) {
        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.before_response(session, ctx).await {
                log::error!("Plugin '{}' failed in before_response: {e}", plugin.name());
            }
        }
    }

    pub async fn after_response(&self, session: &mut Session, ctx: &ProxyContext) {
        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.after_response(session, ctx).await {
                log::error!("Plugin '{}' failed in after_response: {e}", plugin.name());
            }
        }
    }

    pub async fn after_request_log(&self, record: &RequestLog, ctx: &ProxyContext) {
        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.after_request_log(record, ctx).await {
                log::error!("Plugin '{}' failed in after_request_log: {e}", plugin.name());
            }
        }
    }

    pub async fn after_recording_stop(&self, logs: &[RequestLog], ctx: &ProxyContext) {
        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.after_recording_stop(logs, ctx).await {
                log::error!(
                    "Plugin '{}' failed in after_recording_stop: {e}",
                    plugin.name()
                );
            }
        }
    }
}
