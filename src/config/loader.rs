//! File-watched configuration loading
//!
//! Each loader observes one JSON file and keeps an atomically swappable
//! snapshot of its parsed contents. Readers always see either the full
//! prior or the full new snapshot. A missing file is a warning and yields
//! the empty value; a malformed file on reload leaves the previous
//! snapshot authoritative and the watcher armed for the next change.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, Weak},
    time::Duration,
};

use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::core::ProxyResult;

/// Editors emit several change events per save; events inside this window
/// are coalesced into one reload.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// A configuration shape that can be bound to a watched file.
pub trait LoadableConfig: Send + Sync + Sized + 'static {
    /// Human-readable kind used in log messages, e.g. "mocks".
    const KIND: &'static str;

    /// Parse and validate the file contents.
    fn from_json(text: &str) -> ProxyResult<Self>;

    /// The value used while the file is missing or was never valid.
    fn empty() -> Self;
}

/// Hot-reloading holder of one JSON-backed configuration.
pub struct FileLoader<T: LoadableConfig> {
    path: PathBuf,
    current: ArcSwap<T>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl<T: LoadableConfig> FileLoader<T> {
    /// Create a loader and perform the initial load.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let loader = Arc::new(Self {
            path: path.into(),
            current: ArcSwap::from_pointee(T::empty()),
            watcher: Mutex::new(None),
        });
        loader.load();
        loader
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot; cheap, lock-free.
    pub fn snapshot(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// (Re)read the file and swap the snapshot in one step.
    pub fn load(&self) {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!(
                    "Cannot read {} file {}: {e}; using empty configuration",
                    T::KIND,
                    self.path.display()
                );
                self.current.store(Arc::new(T::empty()));
                return;
            }
        };

        match T::from_json(&text) {
            Ok(parsed) => {
                log::info!("Loaded {} from {}", T::KIND, self.path.display());
                self.current.store(Arc::new(parsed));
            }
            Err(e) => {
                log::warn!(
                    "Invalid {} file {}: {e}; keeping previous configuration",
                    T::KIND,
                    self.path.display()
                );
            }
        }
    }

    /// Watch the file's directory and reload on changes to this file.
    ///
    /// Reloads happen on a dedicated thread; the loader itself is only held
    /// weakly there so dropping the last strong reference stops everything.
    pub fn init_watcher(self: &Arc<Self>) -> ProxyResult<()> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| crate::config_error!("Watched path {} has no file name", self.path.display()))?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel::<()>();
        let notify_name = file_name.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(notify_name.as_os_str()));
                    if ours {
                        let _ = tx.send(());
                    }
                }
                Err(e) => log::warn!("File watcher error: {e}"),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);

        let weak: Weak<Self> = Arc::downgrade(self);
        std::thread::Builder::new()
            .name(format!("{}-reload", T::KIND))
            .spawn(move || {
                while rx.recv().is_ok() {
                    // Coalesce the burst of events a single save produces.
                    while rx.recv_timeout(DEBOUNCE_WINDOW).is_ok() {}
                    match weak.upgrade() {
                        Some(loader) => loader.load(),
                        None => break,
                    }
                }
            })
            .map_err(|e| crate::internal_error!("Failed to spawn reload thread: {}", e))?;

        Ok(())
    }

    /// Stop watching. Also happens implicitly on drop.
    pub fn dispose(&self) {
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}
