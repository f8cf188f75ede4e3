//! File system watcher
//!
//! Watches the project root recursively and forwards stable change events
//! into the server as module ids. Events are debounced so a change is only
//! reported once the file has stopped being written.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   notify    │────>│  debouncer  │────>│ UpdateBatcher │
//! │   watcher   │     │  (100ms)    │     │  (enqueue)    │
//! └─────────────┘     └─────────────┘     └──────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};

use crate::error::{HmrError, Result};
use crate::graph::ModuleId;

/// Configuration for the file watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration (default: 100ms)
    pub debounce_duration: Duration,
    /// File extensions to watch
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(100),
            extensions: [
                "js", "jsx", "ts", "tsx", "mjs", "cjs", "css", "scss", "html", "json", "vue",
                "svelte",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Watches a project root and emits module ids for changed source files.
pub struct FileWatcher {
    root: PathBuf,
    config: WatcherConfig,
    running: Arc<AtomicBool>,
}

impl FileWatcher {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            config: WatcherConfig::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(root: PathBuf, config: WatcherConfig) -> Self {
        Self {
            root,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start watching. Changed files are mapped to project-relative module
    /// ids and pushed into `events`; the receiver side decides what to do
    /// with them.
    pub fn start(&self, events: tokio::sync::mpsc::Sender<ModuleId>) -> Result<WatcherHandle> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(WatcherHandle {
                running: Arc::clone(&self.running),
            });
        }

        let root = self.root.clone();
        let config = self.config.clone();
        let running = Arc::clone(&self.running);

        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer(config.debounce_duration, tx).map_err(|e| {
            HmrError::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                HmrError::io(
                    &root,
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;

        let handle_running = Arc::clone(&running);
        std::thread::spawn(move || {
            while handle_running.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(batch)) => {
                        for event in batch {
                            if !matches!(event.kind, DebouncedEventKind::Any) {
                                continue;
                            }
                            if !should_watch_path(&event.path, &config.extensions) {
                                tracing::trace!("ignoring change to {:?}", event.path);
                                continue;
                            }
                            let Ok(rel) = event.path.strip_prefix(&root) else {
                                continue;
                            };
                            let id = ModuleId::from_rel_path(rel);
                            tracing::debug!("file changed: {id}");
                            if events.blocking_send(id).is_err() {
                                // Server side went away
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::error!("watcher error: {e:?}");
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            // Keep the debouncer alive until the thread exits
            drop(debouncer);
        });

        Ok(WatcherHandle { running })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Whether a changed path is interesting: not hidden, not inside a build or
/// dependency directory, and carries a watched extension.
fn should_watch_path(path: &Path, extensions: &[String]) -> bool {
    for component in path.components() {
        if let std::path::Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                return false;
            }
            if matches!(
                name.as_ref(),
                "node_modules" | "target" | "dist" | "build" | "coverage"
            ) {
                return false;
            }
        }
    }

    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e == &ext)
        }
        None => false,
    }
}

/// Handle for controlling a running watcher
pub struct WatcherHandle {
    running: Arc<AtomicBool>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
