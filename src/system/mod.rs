//! Process lifecycle: shutdown propagation, system proxy registration, and
//! watched-process filtering.

pub mod process;
pub mod proxy_settings;

use tokio::sync::watch;

pub use process::ProcessFilter;
pub use proxy_settings::SystemProxyGuard;

/// Root cancellation channel plumbed into the transport.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Flip the shutdown channel when the process receives ctrl-c.
pub fn spawn_signal_handler(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for shutdown signal: {e}");
            return;
        }
        log::info!("Shutdown signal received");
        let _ = tx.send(true);
    });
}
