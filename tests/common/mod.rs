//! Shared test infrastructure
//!
//! Tests build temporary project directories with specific source
//! structures instead of committing fixture files to the repo.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use hotmod::graph::ModuleId;
use hotmod::server::ServerMessage;
use hotmod::{EsmTransformer, ServerOptions, TransformOutput, Transformer};

/// Builder for a throwaway project tree.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().canonicalize().expect("temp dir resolves")
    }

    /// Write a file relative to the project root, creating parents.
    pub fn write(&self, rel: &str, content: &str) -> &Self {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, content).expect("write fixture file");
        self
    }

    #[allow(dead_code)]
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Server options rooted here, with a short batch window so tests stay
    /// fast.
    pub fn options(&self, port: u16) -> ServerOptions {
        ServerOptions::new(port, self.root()).with_batch_window_ms(10)
    }
}

pub fn id(s: &str) -> ModuleId {
    ModuleId::new(s)
}

/// Transformer double that counts invocations and delegates to the real
/// line scanner.
pub struct CountingTransformer {
    inner: EsmTransformer,
    calls: Arc<AtomicUsize>,
}

impl CountingTransformer {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: EsmTransformer::new(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Transformer for CountingTransformer {
    fn transform(
        &self,
        file: &ModuleId,
        code: &str,
        hmr_enabled: bool,
    ) -> hotmod::Result<TransformOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.transform(file, code, hmr_enabled)
    }
}

/// Drain every queued message from a client's outbound receiver.
pub fn drain(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<ServerMessage>,
) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
