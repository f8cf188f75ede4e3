//! Connected client bookkeeping
//!
//! One [`ClientRecord`] per open transport connection: which modules the
//! client has reported loaded, and the socket state. Outbound messages go
//! through a per-client queue; the connection task drains it into the
//! WebSocket, so sends here never block the update pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::graph::ModuleId;
use crate::server::protocol::ServerMessage;

/// Opaque connection handle
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        let short = uuid.split('-').next().unwrap_or("0").to_string();
        Self(format!("cli_{short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closing,
    Closed,
}

/// One record per open connection
#[derive(Debug)]
pub struct ClientRecord {
    pub id: ClientId,
    /// Modules the client has reported as currently instantiated
    pub loaded_modules: BTreeSet<ModuleId>,
    pub socket_state: SocketState,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

/// Registry of connected clients
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<BTreeMap<ClientId, ClientRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. The returned receiver is drained by the
    /// connection task.
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::generate();
        let record = ClientRecord {
            id: id.clone(),
            loaded_modules: BTreeSet::new(),
            socket_state: SocketState::Open,
            outbound: tx,
        };
        self.clients.lock().insert(id.clone(), record);
        (id, rx)
    }

    /// Drop a connection, returning the modules it had loaded so the graph
    /// refcounts can be released.
    pub fn remove(&self, id: &ClientId) -> BTreeSet<ModuleId> {
        self.clients
            .lock()
            .remove(id)
            .map(|record| record.loaded_modules)
            .unwrap_or_default()
    }

    /// Record a `module-loaded` registration. Returns true if this client
    /// had not loaded the module before.
    pub fn mark_loaded(&self, id: &ClientId, module: ModuleId) -> bool {
        self.clients
            .lock()
            .get_mut(id)
            .map(|record| record.loaded_modules.insert(module))
            .unwrap_or(false)
    }

    /// Drop a client's record of `module` (after a prune).
    pub fn mark_unloaded(&self, id: &ClientId, module: &ModuleId) -> bool {
        self.clients
            .lock()
            .get_mut(id)
            .map(|record| record.loaded_modules.remove(module))
            .unwrap_or(false)
    }

    pub fn set_socket_state(&self, id: &ClientId, state: SocketState) {
        if let Some(record) = self.clients.lock().get_mut(id) {
            record.socket_state = state;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn loaded_modules(&self, id: &ClientId) -> BTreeSet<ModuleId> {
        self.clients
            .lock()
            .get(id)
            .map(|record| record.loaded_modules.clone())
            .unwrap_or_default()
    }

    /// Open clients that have loaded `module`.
    pub fn clients_with_module(&self, module: &ModuleId) -> Vec<ClientId> {
        self.clients
            .lock()
            .values()
            .filter(|record| {
                record.socket_state == SocketState::Open
                    && record.loaded_modules.contains(module)
            })
            .map(|record| record.id.clone())
            .collect()
    }

    /// Open clients that have loaded any of `modules`.
    pub fn clients_with_any(&self, modules: &[ModuleId]) -> Vec<ClientId> {
        self.clients
            .lock()
            .values()
            .filter(|record| {
                record.socket_state == SocketState::Open
                    && modules.iter().any(|m| record.loaded_modules.contains(m))
            })
            .map(|record| record.id.clone())
            .collect()
    }

    /// Queue a message to every open client.
    pub fn broadcast(&self, message: ServerMessage) {
        let mut clients = self.clients.lock();
        for record in clients.values_mut() {
            if record.socket_state != SocketState::Open {
                continue;
            }
            if record.outbound.send(message.clone()).is_err() {
                record.socket_state = SocketState::Closed;
            }
        }
    }

    /// Queue a message to one client. A failed send means the connection
    /// task is gone; the record is marked closed.
    pub fn send_to(&self, id: &ClientId, message: ServerMessage) -> bool {
        let mut clients = self.clients.lock();
        let Some(record) = clients.get_mut(id) else {
            return false;
        };
        if record.socket_state != SocketState::Open {
            return false;
        }
        if record.outbound.send(message).is_err() {
            record.socket_state = SocketState::Closed;
            tracing::debug!("client {id} outbound queue closed");
            return false;
        }
        true
    }
}
