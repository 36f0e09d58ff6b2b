//! Watched-process resolution
//!
//! When `--watch-pids` or `--watch-process-names` is set, only traffic
//! originating from those processes is intercepted. The owning process of
//! a client connection is resolved from its source port through the
//! kernel's TCP table (procfs on Linux). On platforms without a lookup,
//! every connection counts as watched.

use std::net::SocketAddr;

/// Filter limiting interception to traffic from selected processes.
#[derive(Debug, Default)]
pub struct ProcessFilter {
    pids: Vec<u32>,
    names: Vec<String>,
}

impl ProcessFilter {
    pub fn new(pids: Vec<u32>, names: Vec<String>) -> Self {
        Self { pids, names }
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty() && self.names.is_empty()
    }

    /// Whether traffic from this client connection should be intercepted.
    pub fn is_watched(&self, peer: SocketAddr) -> bool {
        if self.is_empty() {
            return true;
        }

        match owning_pid(peer) {
            Some(pid) => {
                if self.pids.contains(&pid) {
                    return true;
                }
                match process_name(pid) {
                    Some(name) => self.names.iter().any(|n| n.eq_ignore_ascii_case(&name)),
                    None => false,
                }
            }
            None => {
                log::debug!("Cannot resolve owning process for {peer}; not intercepting");
                false
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn owning_pid(peer: SocketAddr) -> Option<u32> {
    let inode = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|table| std::fs::read_to_string(table).ok())
        .find_map(|table| find_socket_inode(&table, peer.port()))?;
    find_pid_by_inode(inode)
}

#[cfg(not(target_os = "linux"))]
fn owning_pid(_peer: SocketAddr) -> Option<u32> {
    log::debug!("Process lookup is not supported on this platform");
    None
}

/// Find the socket inode for a local TCP port in a procfs net table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn find_socket_inode(table: &str, port: u16) -> Option<u64> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let local = fields[1];
        let local_port = local
            .rsplit_once(':')
            .and_then(|(_, p)| u16::from_str_radix(p, 16).ok());
        if local_port == Some(port) {
            return fields[9].parse().ok();
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn find_pid_by_inode(inode: u64) -> Option<u32> {
    let target = format!("socket:[{inode}]");
    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn process_name(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|name| name.trim().to_string())
}

#[cfg(not(target_os = "linux"))]
fn process_name(_pid: u32) -> Option<String> {
    None
}
