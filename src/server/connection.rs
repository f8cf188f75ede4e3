//! WebSocket connection handling
//!
//! One task per connection: performs the handshake, sends the greeting,
//! then pumps between the socket and the client's outbound queue until
//! either side closes. Graph load refcounts are released on disconnect.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use crate::graph::ModuleId;
use crate::server::protocol::{decode_client_message, ClientMessage, ServerMessage};
use crate::server::registry::SocketState;
use crate::server::ServerShared;

/// Handle a single WebSocket connection
pub async fn handle_connection(stream: TcpStream, shared: Arc<ServerShared>) {
    let addr = stream.peer_addr().ok();
    tracing::info!("new connection from {addr:?}");

    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("WebSocket handshake failed: {e}");
            return;
        }
    };

    let (client_id, mut outbound) = shared.registry.register();

    let greeting = ServerMessage::Connected {
        client_id: client_id.to_string(),
        root: shared.options.root.display().to_string(),
        timestamp: shared.timestamp_ms(),
    };
    if let Err(e) = send_frame(&mut ws, &greeting).await {
        tracing::debug!("greeting to {client_id} failed: {e}");
    }

    loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&shared, &client_id, &text);
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("client {client_id} requested close");
                        shared.registry.set_socket_state(&client_id, SocketState::Closing);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error on {client_id}: {e}");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = send_frame(&mut ws, &message).await {
                            tracing::debug!("send to {client_id} failed: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    cleanup(&shared, &client_id);
    tracing::info!("connection closed from {addr:?}");
}

async fn send_frame(
    ws: &mut WebSocketStream<TcpStream>,
    message: &ServerMessage,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

fn handle_client_message(shared: &ServerShared, client_id: &crate::server::ClientId, text: &str) {
    let Some(message) = decode_client_message(text) else {
        return;
    };
    match message {
        ClientMessage::ModuleLoaded { file } => {
            let module = ModuleId::new(file);
            tracing::debug!("client {client_id} loaded {module}");
            if shared.registry.mark_loaded(client_id, module.clone()) {
                shared.graph.lock().mark_loaded(&module);
            }
        }
        ClientMessage::Ping => {
            shared.registry.send_to(client_id, ServerMessage::Pong);
        }
    }
}

fn cleanup(shared: &ServerShared, client_id: &crate::server::ClientId) {
    let loaded = shared.registry.remove(client_id);
    let mut graph = shared.graph.lock();
    for module in &loaded {
        graph.mark_unloaded(module);
    }
}
