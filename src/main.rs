use std::{net::SocketAddr, path::Path, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;

use devproxy::{
    config::{app_folder, AppConfig, ProxyArgs},
    core::{InvocationContext, ProxyContext, ProxyResult, SharedState, WatchSet},
    logging::RequestLogger,
    plugin::build_plugin_executor,
    proxy::{ProxyServer, UpstreamClient},
    system::{self, ProcessFilter, SystemProxyGuard},
    tls::CertificateAuthority,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ProxyResult<()> {
    // Pin the TLS crypto provider before any rustls config is built.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider was already installed");
    }

    // Read command-line arguments
    let args = ProxyArgs::parse();

    // Load configuration with CLI overrides
    let mut config = if Path::new(&args.config_file).exists() {
        AppConfig::load_from_json(&args.config_file)?
    } else {
        log::warn!("Config file {} not found; using defaults", args.config_file);
        AppConfig::default()
    };
    config.merge_with_args(&args);

    let app_folder = app_folder();
    let watch = Arc::new(WatchSet::from_specs(&config.urls_to_watch)?);
    if watch.is_empty() {
        log::warn!("No URLs to watch configured; all traffic will be tunneled untouched");
    }

    let ctx = Arc::new(ProxyContext {
        state: Arc::new(SharedState::new()),
        logger: Arc::new(RequestLogger::new(config.show_skip_messages)),
        watch,
        app_folder: app_folder.clone(),
    });

    // Build the plugin chain in declaration order
    log::info!("Loading plugins...");
    let executor = Arc::new(build_plugin_executor(&config, &ctx)?);
    executor.init(&ctx).await?;

    let invocation = InvocationContext {
        record: config.record,
        failure_rate: args.failure_rate,
        allowed_errors: args.allowed_errors.clone(),
        no_first_run: args.no_first_run,
    };
    executor.options_loaded(&invocation, &ctx).await?;

    // Certificate authority for TLS interception
    let ca = Arc::new(CertificateAuthority::ensure_root(&app_folder)?);
    if config.install_cert && !args.no_first_run {
        ca.install_os_trust(&app_folder);
    }

    let upstream = UpstreamClient::new(config.timeout_seconds)?;
    let process_filter = ProcessFilter::new(
        config.watch_pids.clone(),
        config.watch_process_names.clone(),
    );

    if config.record {
        log::info!("Recording...");
        ctx.state.start_recording();
    }

    let proxy_guard = if config.as_system_proxy {
        SystemProxyGuard::register(&config.ip_address, config.port)
    } else {
        SystemProxyGuard::inactive()
    };

    let addr: SocketAddr = format!("{}:{}", config.ip_address, config.port)
        .parse()
        .map_err(|e| devproxy::config_error!("Invalid listen address: {}", e))?;

    let (shutdown_tx, shutdown_rx) = system::shutdown_channel();
    system::spawn_signal_handler(shutdown_tx);

    let server = Arc::new(ProxyServer::new(
        ctx.clone(),
        executor.clone(),
        ca,
        upstream,
        process_filter,
    ));
    let result = server.run(addr, shutdown_rx).await;

    // Let in-flight sessions write their responses best-effort.
    tokio::time::sleep(Duration::from_millis(500)).await;

    if ctx.state.is_recording() {
        ctx.state.stop_recording();
        let logs = ctx.state.drain_request_logs();
        log::info!("Stopped recording; {} log records collected", logs.len());
        executor.after_recording_stop(&logs, &ctx).await;
    }

    proxy_guard.restore();

    result
}
