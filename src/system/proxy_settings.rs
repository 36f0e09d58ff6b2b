//! System proxy registration
//!
//! With `--as-system-proxy` the proxy registers itself as the OS HTTP/HTTPS
//! proxy at startup and restores the previous state on exit. Restoration
//! must run on every exit path, so the guard is idempotent and also fires
//! from `Drop`.

use std::{
    process::Command,
    sync::atomic::{AtomicBool, Ordering},
};

/// macOS network service the proxy settings are applied to.
const MACOS_NETWORK_SERVICE: &str = "Wi-Fi";

pub struct SystemProxyGuard {
    active: AtomicBool,
}

impl SystemProxyGuard {
    /// Register the proxy as the system proxy. Failures are logged, not
    /// fatal: the proxy still works for clients configured explicitly.
    pub fn register(address: &str, port: u16) -> Self {
        let ok = if cfg!(target_os = "linux") {
            set_linux_proxy(address, port)
        } else if cfg!(target_os = "macos") {
            set_macos_proxy(address, port)
        } else {
            log::warn!("System proxy registration is not supported on this platform");
            false
        };

        if ok {
            log::info!("Registered as system proxy on {address}:{port}");
        }

        Self {
            active: AtomicBool::new(ok),
        }
    }

    /// Inert guard for runs without `--as-system-proxy`.
    pub fn inactive() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// Restore the previous system proxy state. Safe to call repeatedly.
    pub fn restore(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let ok = if cfg!(target_os = "linux") {
            run(Command::new("gsettings").args(["set", "org.gnome.system.proxy", "mode", "none"]))
        } else {
            run(Command::new("networksetup").args(["-setwebproxystate", MACOS_NETWORK_SERVICE, "off"]))
                && run(Command::new("networksetup")
                    .args(["-setsecurewebproxystate", MACOS_NETWORK_SERVICE, "off"]))
        };

        if ok {
            log::info!("System proxy settings restored");
        }
    }
}

impl Drop for SystemProxyGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

fn run(command: &mut Command) -> bool {
    match command.output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            log::error!(
                "{:?} exited with {}: {}",
                command.get_program(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            log::error!("Cannot run {:?}: {e}", command.get_program());
            false
        }
    }
}

fn set_linux_proxy(address: &str, port: u16) -> bool {
    let port = port.to_string();
    run(Command::new("gsettings").args(["set", "org.gnome.system.proxy", "mode", "manual"]))
        && run(Command::new("gsettings").args(["set", "org.gnome.system.proxy.http", "host", address]))
        && run(Command::new("gsettings").args(["set", "org.gnome.system.proxy.http", "port", &port]))
        && run(Command::new("gsettings").args(["set", "org.gnome.system.proxy.https", "host", address]))
        && run(Command::new("gsettings").args(["set", "org.gnome.system.proxy.https", "port", &port]))
}

fn set_macos_proxy(address: &str, port: u16) -> bool {
    let port = port.to_string();
    run(Command::new("networksetup").args(["-setwebproxy", MACOS_NETWORK_SERVICE, address, &port]))
        && run(Command::new("networksetup")
            .args(["-setsecurewebproxy", MACOS_NETWORK_SERVICE, address, &port]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_guard_restores_nothing() {
        let guard = SystemProxyGuard::inactive();
        // Must be a no-op; calling twice exercises the idempotence path.
        guard.restore();
        guard.restore();
    }
}
