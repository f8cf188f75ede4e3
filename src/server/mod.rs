//! HMR server
//!
//! The orchestrator that ties the pieces together:
//!
//! ```text
//! ┌─────────┐    ┌──────────────┐    ┌─────────────┐    ┌───────────────┐
//! │ watcher │───>│ UpdateBatcher │───>│ Transformer │───>│  ModuleGraph  │
//! └─────────┘    └──────────────┘    └─────────────┘    └───────┬───────┘
//!                                                              │
//!                                   ┌──────────────┐    ┌──────▼────────┐
//!                  WebSocket <──────│ ClientRegistry│<───│ UpdatePlanner │
//!                                   └──────────────┘    └───────────────┘
//! ```
//!
//! Each change event becomes a batcher job. The handler reads the file,
//! transforms it, applies the result to the graph, plans the push, and
//! emits protocol messages to every interested open client.

pub mod protocol;
pub mod registry;

mod connection;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::batcher::{BatchHandler, UpdateBatcher, UpdateHandle};
use crate::config::ServerOptions;
use crate::error::{HmrError, Result};
use crate::graph::{ModuleGraph, ModuleId};
use crate::planner::{UpdatePlan, UpdatePlanner};
use crate::transform::{detect_hot_directives, Transformer};
use crate::watcher::FileWatcher;

pub use connection::handle_connection;
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{ClientId, ClientRegistry, SocketState};

/// State shared between the update pipeline and the connection tasks.
pub struct ServerShared {
    pub options: ServerOptions,
    pub graph: Mutex<ModuleGraph>,
    pub registry: ClientRegistry,
    transformer: Box<dyn Transformer>,
    planner: UpdatePlanner,
    started: Instant,
}

impl ServerShared {
    pub fn new(options: ServerOptions, transformer: Box<dyn Transformer>) -> Arc<Self> {
        Arc::new(Self {
            options,
            graph: Mutex::new(ModuleGraph::new()),
            registry: ClientRegistry::new(),
            transformer,
            planner: UpdatePlanner::new(),
            started: Instant::now(),
        })
    }

    /// Monotonic milliseconds since server start; protocol timestamps and
    /// cache-busting queries both use this clock.
    pub fn timestamp_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run one changed file through the pipeline: read, transform, update
    /// the graph, plan, notify clients.
    ///
    /// User-visible failures (IO, parse, analysis) are converted to `error`
    /// protocol messages and return `Ok`; only programming errors propagate.
    pub async fn process_file(self: &Arc<Self>, file: &ModuleId) -> Result<()> {
        let path = self.options.root.join(file.as_str());

        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("failed to read {file}: {e}");
                self.surface_error(file, &format!("failed to read {file}: {e}"), None);
                return Ok(());
            }
        };

        let output = match self.transformer.transform(file, &source, true) {
            Ok(output) => output,
            Err(e) if e.is_user_visible() => {
                tracing::warn!("transform failed for {file}: {e}");
                self.graph.lock().record_error(file, e.to_string());
                self.surface_error(file, &e.to_string(), None);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let plan = {
            let mut graph = self.graph.lock();
            let changed = graph.update_module(file, output.code, &output.deps, true);
            if !changed {
                tracing::debug!("{file}: content unchanged, skipping");
                return Ok(());
            }
            graph.set_exports(file, &output.exports);

            let directives = detect_hot_directives(&source);
            if let Some(node) = graph.get_module_mut(file) {
                let hot = node.hot_mut();
                hot.accept_callbacks = directives.accept_callbacks;
                hot.dispose_callbacks = directives.dispose_callbacks;
                if directives.declines {
                    hot.decline();
                } else if directives.accepts {
                    hot.accept();
                } else {
                    hot.clear_declarations();
                }
            }

            self.planner.plan(&mut graph, file)
        };

        self.push_plan(file, &plan);
        Ok(())
    }

    /// Emit the protocol messages a plan calls for.
    fn push_plan(&self, file: &ModuleId, plan: &UpdatePlan) {
        let timestamp = self.timestamp_ms();

        if plan.requires_full_reload {
            let interested = self.registry.clients_with_any(&plan.chain);
            tracing::info!(
                "{file}: full reload for {} client(s)",
                interested.len()
            );
            for client in interested {
                self.registry
                    .send_to(&client, ServerMessage::FullReload { path: None });
            }
        } else {
            for module in &plan.chain {
                for client in self.registry.clients_with_module(module) {
                    self.registry.send_to(
                        &client,
                        ServerMessage::Update {
                            file: module.to_string(),
                            timestamp,
                        },
                    );
                }
            }
            if !plan.chain.is_empty() {
                tracing::info!(
                    "{file}: pushed update chain of {} module(s), boundary {:?}",
                    plan.chain.len(),
                    plan.boundary
                );
            }
        }

        if !plan.pruned_modules.is_empty() {
            let paths: Vec<String> = plan
                .pruned_modules
                .iter()
                .map(|m| m.to_string())
                .collect();
            tracing::info!("{file}: pruned {paths:?}");
            self.registry.broadcast(ServerMessage::Prune { paths });
        }
    }

    /// Send an `error` message to every open client that loaded `file`.
    fn surface_error(&self, file: &ModuleId, error: &str, stack: Option<String>) {
        let message = ServerMessage::Error {
            file: file.to_string(),
            error: error.to_string(),
            stack,
            timestamp: self.timestamp_ms(),
        };
        for client in self.registry.clients_with_module(file) {
            self.registry.send_to(&client, message.clone());
        }
    }
}

/// The HMR server: owns the transport listener, the watcher subscription,
/// the module graph, the batcher and the client registry.
pub struct HmrServer {
    shared: Arc<ServerShared>,
    batcher: UpdateBatcher,
}

impl HmrServer {
    /// Build the server. Must be called within a tokio runtime; the batcher
    /// workers spawn immediately.
    pub fn new(options: ServerOptions, transformer: Box<dyn Transformer>) -> Result<Self> {
        options.validate()?;
        let shared = ServerShared::new(options.clone(), transformer);

        let handler_shared = Arc::clone(&shared);
        let handler: BatchHandler = Arc::new(move |files| {
            let shared = Arc::clone(&handler_shared);
            Box::pin(async move {
                for file in files {
                    shared.process_file(&file).await?;
                }
                Ok(())
            })
        });

        let batcher = UpdateBatcher::new(&options, handler);
        Ok(Self { shared, batcher })
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        Arc::clone(&self.shared)
    }

    /// Designate a project entry point; entries are never pruned.
    pub fn set_entry(&self, file: ModuleId) {
        self.shared.graph.lock().set_entry(file);
    }

    /// Queue a change event, as the watcher would.
    pub fn notify_change(&self, file: ModuleId) -> UpdateHandle {
        self.batcher.enqueue(file)
    }

    /// Bind the listener, start the watcher, and serve until the task is
    /// cancelled.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.shared.options.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| HmrError::Transport {
            message: format!("failed to bind {addr}: {e}"),
        })?;
        tracing::info!("hotmod listening on ws://{addr}");
        tracing::info!("watching {:?}", self.shared.options.root);

        let (events_tx, mut events_rx) = mpsc::channel::<ModuleId>(256);
        let watcher = FileWatcher::new(self.shared.options.root.clone());
        let _watcher_handle = watcher.start(events_tx)?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!("accepted connection from {peer}");
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                handle_connection(stream, shared).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("failed to accept connection: {e}");
                        }
                    }
                }

                changed = events_rx.recv() => {
                    match changed {
                        Some(file) => {
                            // Fire and forget; completion is observable
                            // through the handle when callers need it
                            let _ = self.batcher.enqueue(file);
                        }
                        None => {
                            tracing::warn!("watcher channel closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// The project root this server serves.
    pub fn root(&self) -> PathBuf {
        self.shared.options.root.clone()
    }
}
