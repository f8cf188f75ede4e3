//! hotmod: a development-time hot module replacement engine
//!
//! Watches source files under a project root, transforms changed modules
//! into browser-executable form, computes the minimal set of modules that
//! must be refreshed in each connected browser, and drives a push-based
//! update protocol over WebSocket so running code can swap in new module
//! versions without a full page reload.
//!
//! # Pipeline
//!
//! ```text
//! file change ──> UpdateBatcher ──> Transformer ──> ModuleGraph
//!                                                       │
//!                 WebSocket <── ClientRegistry <── UpdatePlanner
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hotmod::{EsmTransformer, HmrServer, ServerOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ServerOptions::new(3100, "/path/to/project");
//!     let server = HmrServer::new(options, Box::new(EsmTransformer::new()))?;
//!     server.set_entry("src/main.js".into());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod server;
pub mod tracker;
pub mod transform;
pub mod watcher;

// Re-export commonly used types
pub use batcher::{Priority, UpdateBatcher, UpdateHandle, UpdateOutcome};
pub use client::{ClientRuntime, HotContext, ModuleFetcher, ModuleRecord};
pub use config::ServerOptions;
pub use error::{HmrError, Result};
pub use graph::{HotState, ModuleGraph, ModuleId, ModuleNode};
pub use planner::{UpdatePlan, UpdatePlanner};
pub use server::{ClientMessage, ClientRegistry, HmrServer, ServerMessage, ServerShared};
pub use tracker::{ExportTracker, TrackedExports};
pub use transform::{content_hash, EsmTransformer, TransformOutput, Transformer};
pub use watcher::{FileWatcher, WatcherConfig};
