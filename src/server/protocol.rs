//! Wire protocol message types
//!
//! JSON messages, one per WebSocket text frame, tagged by `type`. Unknown
//! message types are logged and ignored on both sides.

use serde::{Deserialize, Serialize};

/// Server-to-client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Re-fetch and hot-swap the named module
    Update {
        file: String,
        /// Monotonic milliseconds; doubles as the cache-busting query
        timestamp: u64,
    },
    /// Reload the whole page
    FullReload {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Render an overlay / log
    Error {
        file: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        timestamp: u64,
    },
    /// Drop records for no-longer-reachable modules
    Prune { paths: Vec<String> },
    /// Handshake greeting, sent once per connection
    Connected {
        client_id: String,
        root: String,
        timestamp: u64,
    },
    /// Liveness response
    Pong,
}

/// Client-to-server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register the connection as interested in updates to `file`
    ModuleLoaded { file: String },
    /// Liveness probe
    Ping,
}

/// Decode an incoming frame. Unknown or malformed messages yield `None`
/// after being logged.
pub fn decode_client_message(text: &str) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!("ignoring unknown client message: {e}");
            None
        }
    }
}

/// Decode a server frame on the client side, same ignore policy.
pub fn decode_server_message(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!("ignoring unknown server message: {e}");
            None
        }
    }
}
