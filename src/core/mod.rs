//! Core abstractions for the interception engine
//!
//! This module provides the foundational types shared by the transport,
//! the plugin chain, and the configuration layer.

pub mod error;
pub mod plugin;
pub mod session;
pub mod state;
pub mod watch;

// Re-export commonly used types
pub use error::{ErrorContext, ProxyError, ProxyResult};
pub use plugin::{
    request_guard, url_in_scope, InvocationContext, PluginCreateFn, PluginExecutor, ProxyContext,
    ProxyPlugin,
};
pub use session::{RequestData, ResponseData, ResponseState, Session};
pub use state::{SharedState, ShouldThrottle, ThrottlerInfo, ThrottlingInfo};
pub use watch::{WatchPattern, WatchSet};
