//! Client-side HMR runtime
//!
//! The in-browser counterpart of the server, modelled host-side so the
//! protocol and the accept/dispose semantics are executable in one process.
//! Holds one record per loaded module, applies `update` messages against
//! them, and escalates to a full page reload when hot application is not
//! possible.
//!
//! Applying an update runs the module's dispose callbacks, carries
//! `hot.data` over to the re-fetched module, swaps the exports reference,
//! then runs the accept callbacks with the new namespace. Callback errors
//! are isolated: the remaining callbacks still run, and a failed accept
//! marks the module dirty so the next update for it requests a reload
//! instead of swapping stale state.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::graph::ModuleId;
use crate::server::protocol::ServerMessage;

/// Exports namespace of one module instance
pub type Exports = Map<String, Value>;

/// Invoked with the new module's exports after a hot swap
pub type AcceptCallback = Box<dyn FnMut(&Exports) -> Result<(), String>>;
/// Invoked with the persisted data slot before the module unloads
pub type DisposeCallback = Box<dyn FnMut(&mut Value) -> Result<(), String>>;

/// The `hot` API surface a module sees.
#[derive(Default)]
pub struct HotContext {
    /// Opaque storage carried across reloads
    pub data: Value,
    accept_callbacks: Vec<AcceptCallback>,
    dispose_callbacks: Vec<DisposeCallback>,
    is_accepted: bool,
    is_declined: bool,
}

impl HotContext {
    /// Accept updates for this module.
    pub fn accept(&mut self) {
        self.is_accepted = true;
        self.is_declined = false;
    }

    /// Accept updates and run `callback` with each new namespace.
    pub fn accept_with(&mut self, callback: AcceptCallback) {
        self.accept_callbacks.push(callback);
        self.accept();
    }

    /// Refuse hot updates; changes reaching this module force a reload.
    pub fn decline(&mut self) {
        self.is_declined = true;
        self.is_accepted = false;
    }

    /// Run `callback` before this module is swapped out.
    pub fn dispose(&mut self, callback: DisposeCallback) {
        self.dispose_callbacks.push(callback);
    }

    pub fn is_accepted(&self) -> bool {
        self.is_accepted
    }

    pub fn is_declined(&self) -> bool {
        self.is_declined
    }
}

/// One record per instantiated module
#[derive(Default)]
pub struct ModuleRecord {
    pub exports: Exports,
    pub hot: HotContext,
}

/// Re-fetches a module after an update. `cache_bust` is the `?t=` query
/// value taken from the update's timestamp.
pub trait ModuleFetcher {
    fn fetch(&mut self, file: &ModuleId, cache_bust: u64) -> Result<Exports, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeState {
    Idle,
    Applying,
}

/// The client runtime state machine.
pub struct ClientRuntime<F> {
    modules: BTreeMap<ModuleId, ModuleRecord>,
    fetcher: F,
    state: RuntimeState,
    /// Updates that arrived while one was being applied; a newer update
    /// for a file supersedes an older queued one
    pending: BTreeMap<ModuleId, u64>,
    /// Modules whose accept callback failed; the next update for them
    /// requests a reload
    dirty: BTreeSet<ModuleId>,
    reload_requested: bool,
}

impl<F: ModuleFetcher> ClientRuntime<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            modules: BTreeMap::new(),
            fetcher,
            state: RuntimeState::Idle,
            pending: BTreeMap::new(),
            dirty: BTreeSet::new(),
            reload_requested: false,
        }
    }

    /// Instantiate a module record, as the module loader would on first
    /// import.
    pub fn register_module(&mut self, file: ModuleId, exports: Exports) {
        self.modules.insert(
            file,
            ModuleRecord {
                exports,
                hot: HotContext::default(),
            },
        );
    }

    /// The module's `hot` handle, for accept/decline/dispose registration.
    pub fn hot(&mut self, file: &ModuleId) -> Option<&mut HotContext> {
        self.modules.get_mut(file).map(|record| &mut record.hot)
    }

    pub fn exports(&self, file: &ModuleId) -> Option<&Exports> {
        self.modules.get(file).map(|record| &record.exports)
    }

    /// Files this runtime would register `module-loaded` interest for.
    pub fn loaded_files(&self) -> Vec<ModuleId> {
        self.modules.keys().cloned().collect()
    }

    /// Whether a full page reload has been requested.
    pub fn reload_requested(&self) -> bool {
        self.reload_requested
    }

    /// Consume the reload request, as the embedder does right before
    /// actually reloading.
    pub fn take_reload_request(&mut self) -> bool {
        std::mem::take(&mut self.reload_requested)
    }

    /// React to one server message.
    pub fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Update { file, timestamp } => {
                self.apply_update(ModuleId::new(file), timestamp);
            }
            ServerMessage::FullReload { path } => {
                tracing::info!("full reload requested (path {path:?})");
                self.reload_requested = true;
            }
            ServerMessage::Error {
                file,
                error,
                stack,
                ..
            } => {
                tracing::error!("server error for {file}: {error}");
                if let Some(stack) = stack {
                    tracing::error!("{stack}");
                }
            }
            ServerMessage::Prune { paths } => {
                for path in paths {
                    let file = ModuleId::new(path);
                    self.modules.remove(&file);
                    self.pending.remove(&file);
                    self.dirty.remove(&file);
                }
            }
            ServerMessage::Connected { client_id, .. } => {
                tracing::debug!("connected as {client_id}");
            }
            ServerMessage::Pong => {}
        }
    }

    /// Queue the update, then drain the pending set one file at a time
    /// unless a drain is already in progress further up the stack.
    fn apply_update(&mut self, file: ModuleId, timestamp: u64) {
        let slot = self.pending.entry(file).or_insert(timestamp);
        *slot = (*slot).max(timestamp);

        if self.state == RuntimeState::Applying {
            return;
        }
        self.state = RuntimeState::Applying;
        while let Some((next, ts)) = self.pending.pop_first() {
            self.apply_one(&next, ts);
        }
        self.state = RuntimeState::Idle;
    }

    fn apply_one(&mut self, file: &ModuleId, timestamp: u64) {
        if !self.modules.contains_key(file) {
            tracing::debug!("ignoring update for unknown module {file}");
            return;
        }

        if self.dirty.remove(file) {
            tracing::warn!("{file} is dirty from a failed accept, requesting reload");
            self.reload_requested = true;
            return;
        }

        let record = self.modules.get_mut(file).expect("checked above");

        // Dispose callbacks run first and may stash state into hot.data
        for (index, callback) in record.hot.dispose_callbacks.iter_mut().enumerate() {
            if let Err(e) = callback(&mut record.hot.data) {
                tracing::error!("dispose callback {index} for {file} failed: {e}");
            }
        }

        let preserved = std::mem::take(&mut record.hot.data);

        let fresh = match self.fetcher.fetch(file, timestamp) {
            Ok(exports) => exports,
            Err(e) => {
                tracing::error!("re-fetch of {file} failed: {e}");
                record.hot.data = preserved;
                return;
            }
        };

        record.exports = fresh;
        record.hot.data = preserved;

        let mut accept_failed = false;
        for (index, callback) in record.hot.accept_callbacks.iter_mut().enumerate() {
            if let Err(e) = callback(&record.exports) {
                tracing::error!("accept callback {index} for {file} failed: {e}");
                accept_failed = true;
            }
        }
        if accept_failed {
            self.dirty.insert(file.clone());
        }
    }
}
