pub mod loader;

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::core::{ProxyError, ProxyResult};

/// Token in configured paths that resolves to the executable's directory.
pub const APP_FOLDER_TOKEN: &str = "~appFolder";

/// Command-line surface.
///
/// Flags override the corresponding fields of the loaded configuration.
#[derive(Debug, Default, Parser)]
#[command(name = "devproxy", about = "Local fault-injection and API simulation proxy")]
pub struct ProxyArgs {
    /// Port the proxy listens on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address the proxy binds to
    #[arg(long)]
    pub ip_address: Option<String>,

    /// Start with request recording enabled
    #[arg(short, long)]
    pub record: bool,

    /// Only intercept traffic from these process ids
    #[arg(long, num_args = 1..)]
    pub watch_pids: Vec<u32>,

    /// Only intercept traffic from processes with these names
    #[arg(long, num_args = 1..)]
    pub watch_process_names: Vec<String>,

    /// Percentage of in-scope requests to fail (0-100)
    #[arg(short, long)]
    pub failure_rate: Option<u8>,

    /// Skip first-run initialization (certificate setup)
    #[arg(long)]
    pub no_first_run: bool,

    /// Register the proxy as the system HTTP/HTTPS proxy
    #[arg(long)]
    pub as_system_proxy: Option<bool>,

    /// Install the root certificate into the OS trust store
    #[arg(long)]
    pub install_cert: Option<bool>,

    /// Status codes the chaos plugin may inject
    #[arg(short, long, num_args = 1..)]
    pub allowed_errors: Vec<u16>,

    /// Path to the configuration file
    #[arg(long, default_value = "devproxyrc.json")]
    pub config_file: String,
}

/// A plugin entry in the main configuration, in chain order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PluginReference {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "PluginReference::default_enabled")]
    pub enabled: bool,

    /// Per-plugin watch list; empty means the global list applies.
    #[serde(default)]
    pub urls_to_watch: Vec<String>,

    /// Name of the top-level config object holding this plugin's settings.
    #[serde(default)]
    pub config_section: Option<String>,

    /// Accepted for config compatibility; plugins resolve through the
    /// compiled-in registry, so the path itself is unused.
    #[serde(default)]
    pub plugin_path: Option<String>,
}

impl PluginReference {
    fn default_enabled() -> bool {
        true
    }
}

/// Root configuration loaded from the main JSON file.
///
/// Per-plugin config sections are arbitrary top-level objects referenced by
/// name from [`PluginReference::config_section`]; they are captured in
/// `sections` without interpretation.
#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_port")]
    pub port: u16,

    #[serde(default = "AppConfig::default_ip_address")]
    pub ip_address: String,

    #[serde(default)]
    pub urls_to_watch: Vec<String>,

    #[validate(nested)]
    #[serde(default)]
    pub plugins: Vec<PluginReference>,

    #[serde(default)]
    pub record: bool,

    #[serde(default)]
    pub show_skip_messages: bool,

    #[serde(default)]
    pub as_system_proxy: bool,

    #[serde(default = "AppConfig::default_install_cert")]
    pub install_cert: bool,

    #[serde(default)]
    pub watch_pids: Vec<u32>,

    #[serde(default)]
    pub watch_process_names: Vec<String>,

    /// Upstream fetch timeout in seconds.
    #[serde(default = "AppConfig::default_timeout_seconds")]
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,

    #[serde(flatten)]
    sections: serde_json::Map<String, JsonValue>,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("Default config must parse")
    }
}

impl AppConfig {
    fn default_port() -> u16 {
        8000
    }

    fn default_ip_address() -> String {
        "127.0.0.1".to_string()
    }

    fn default_install_cert() -> bool {
        true
    }

    fn default_timeout_seconds() -> u64 {
        100
    }

    /// Loads configuration from a JSON file with validation.
    ///
    /// Synchronous loading is intentional; configuration must be validated
    /// before any async work starts.
    pub fn load_from_json<P>(path: P) -> ProxyResult<Self>
    where
        P: AsRef<Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| ProxyError::Configuration(format!("Unable to read conf file {path}: {e}")))?;
        log::debug!("Conf file read from {path}");
        Self::from_json(&conf_str)
    }

    /// Parses a JSON configuration string with validation.
    pub fn from_json(conf_str: &str) -> ProxyResult<Self> {
        let conf: AppConfig = serde_json::from_str(conf_str)
            .map_err(|e| ProxyError::Configuration(format!("Unable to parse conf: {e}")))?;
        conf.validate()?;
        Ok(conf)
    }

    /// Applies command-line overrides to the loaded configuration.
    pub fn merge_with_args(&mut self, args: &ProxyArgs) {
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(ref ip) = args.ip_address {
            self.ip_address = ip.clone();
        }
        if args.record {
            self.record = true;
        }
        if !args.watch_pids.is_empty() {
            self.watch_pids = args.watch_pids.clone();
        }
        if !args.watch_process_names.is_empty() {
            self.watch_process_names = args.watch_process_names.clone();
        }
        if let Some(as_system_proxy) = args.as_system_proxy {
            self.as_system_proxy = as_system_proxy;
        }
        if let Some(install_cert) = args.install_cert {
            self.install_cert = install_cert;
        }
    }

    /// Fetch a named per-plugin config section. Plugins without a section
    /// get an empty object so factories can apply their defaults.
    pub fn plugin_section(&self, reference: &PluginReference) -> JsonValue {
        reference
            .config_section
            .as_ref()
            .and_then(|name| self.sections.get(name).cloned())
            .unwrap_or_else(|| JsonValue::Object(serde_json::Map::new()))
    }

    /// Plugins to load, in declaration order, disabled entries dropped.
    pub fn enabled_plugins(&self) -> impl Iterator<Item = &PluginReference> {
        self.plugins.iter().filter(|p| p.enabled)
    }
}

/// Resolve a configured path, expanding a leading [`APP_FOLDER_TOKEN`].
pub fn resolve_config_path(path: &str, app_folder: &Path) -> PathBuf {
    match path.strip_prefix(APP_FOLDER_TOKEN) {
        Some(rest) => {
            let rest = rest.trim_start_matches(['/', '\\']);
            app_folder.join(rest)
        }
        None => PathBuf::from(path),
    }
}

/// Directory of the running executable, falling back to the working
/// directory when it cannot be determined.
pub fn app_folder() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
