//! Server configuration
//!
//! A single options record drives the daemon. No environment variables are
//! part of the core contract; `RUST_LOG` only feeds the tracing filter.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HmrError, Result};

/// Default number of concurrently running update batches.
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default batch collection window in milliseconds.
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 100;
/// Default maximum number of jobs per batch.
pub const DEFAULT_MAX_BATCH: usize = 10;

/// Options for [`HmrServer`](crate::server::HmrServer)
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port the WebSocket listener binds to
    pub port: u16,
    /// Absolute project root; all module ids are relative to it
    pub root: PathBuf,
    /// In-flight update batches (1..=32)
    pub concurrency: usize,
    /// Batch collection window in milliseconds (10..=1000)
    pub batch_window_ms: u64,
    /// Maximum jobs collected into one batch (1..=100)
    pub max_batch: usize,
}

impl ServerOptions {
    /// Create options with defaults for everything but port and root.
    pub fn new(port: u16, root: impl Into<PathBuf>) -> Self {
        Self {
            port,
            root: root.into(),
            concurrency: DEFAULT_CONCURRENCY,
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_window_ms(mut self, window_ms: u64) -> Self {
        self.batch_window_ms = window_ms;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Validate option ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(HmrError::Config {
                message: format!("root must be an absolute path, got {:?}", self.root),
            });
        }
        if !(1..=32).contains(&self.concurrency) {
            return Err(HmrError::Config {
                message: format!("concurrency must be in 1..=32, got {}", self.concurrency),
            });
        }
        if !(10..=1000).contains(&self.batch_window_ms) {
            return Err(HmrError::Config {
                message: format!(
                    "batch_window_ms must be in 10..=1000, got {}",
                    self.batch_window_ms
                ),
            });
        }
        if !(1..=100).contains(&self.max_batch) {
            return Err(HmrError::Config {
                message: format!("max_batch must be in 1..=100, got {}", self.max_batch),
            });
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}
