//! Cross-request shared state
//!
//! Process-wide registry consulted by plugins across sessions: the
//! throttler list, per-plugin global data slots, the reports bag, and the
//! recording buffer. Each slot is guarded independently so unrelated
//! plugins never contend on one lock.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde_json::Value as JsonValue;

use super::session::RequestData;
use crate::logging::RequestLog;

/// Result of consulting one throttler for one request.
#[derive(Debug, Clone)]
pub struct ThrottlingInfo {
    /// Remaining throttle window in seconds; `> 0` means reject now.
    pub throttle_for_seconds: u64,
    /// Header name carrying the retry hint, usually `Retry-After`.
    pub retry_after_header_name: String,
}

impl ThrottlingInfo {
    pub fn none() -> Self {
        Self {
            throttle_for_seconds: 0,
            retry_after_header_name: "Retry-After".to_string(),
        }
    }
}

pub type ShouldThrottle = Box<dyn Fn(&RequestData, &str) -> ThrottlingInfo + Send + Sync>;

/// Shared record coordinating 429 behavior across plugins for one key.
pub struct ThrottlerInfo {
    pub throttling_key: String,
    pub should_throttle: ShouldThrottle,
    pub reset_time: Instant,
}

impl ThrottlerInfo {
    pub fn new(throttling_key: impl Into<String>, window: Duration, should_throttle: ShouldThrottle) -> Self {
        Self {
            throttling_key: throttling_key.into(),
            should_throttle,
            reset_time: Instant::now() + window,
        }
    }
}

/// Process-wide state registry shared by all plugins.
#[derive(Default)]
pub struct SharedState {
    throttlers: Mutex<Vec<ThrottlerInfo>>,
    global_data: DashMap<String, Arc<dyn Any + Send + Sync>>,
    reports: DashMap<String, JsonValue>,
    request_logs: Mutex<Vec<RequestLog>>,
    recording: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the throttler list for iteration or mutation.
    pub fn throttlers(&self) -> MutexGuard<'_, Vec<ThrottlerInfo>> {
        self.throttlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_throttler(&self, throttler: ThrottlerInfo) {
        self.throttlers().push(throttler);
    }

    /// Drop throttlers whose window has passed. Called by the retry-after
    /// gate at the start of each request.
    pub fn reap_expired_throttlers(&self, now: Instant) {
        self.throttlers().retain(|t| t.reset_time >= now);
    }

    /// Store a plugin's global data slot, keyed by plugin name.
    pub fn set_global<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.global_data.insert(key.into(), Arc::new(value));
    }

    /// Fetch a plugin's global data slot.
    pub fn get_global<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.global_data
            .get(key)
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Fetch a plugin's global data slot, inserting a default-built value
    /// on first use.
    pub fn global_or_insert_with<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let entry = self
            .global_data
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()));
        entry
            .value()
            .clone()
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("Global data slot '{key}' holds a different type"))
    }

    pub fn insert_report(&self, plugin_name: impl Into<String>, report: JsonValue) {
        self.reports.insert(plugin_name.into(), report);
    }

    pub fn reports_snapshot(&self) -> Vec<(String, JsonValue)> {
        self.reports
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn start_recording(&self) {
        self.recording.store(true, Ordering::SeqCst);
    }

    pub fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Append a flushed request log to the recording buffer. No-op when not
    /// recording.
    pub fn record_request_log(&self, record: RequestLog) {
        if !self.is_recording() {
            return;
        }
        self.request_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Take the recorded logs, leaving the buffer empty.
    pub fn drain_request_logs(&self) -> Vec<RequestLog> {
        std::mem::take(&mut *self.request_logs.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
