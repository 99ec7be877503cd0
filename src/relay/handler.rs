//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and manages the connection lifecycle.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use super::server::{Attachment, RelayServer};
use super::session::SessionKey;
use crate::api::AppState;

/// Query parameters of the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Upstream user whose terrariums the client wants to watch
    pub user: Option<String>,
}

/// WebSocket upgrade handler
///
/// Resolves the session from the request and hands the socket to the relay.
/// No handshake payload is expected from the client.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let relay = Arc::clone(&state.relay);
    let session = relay.session_for(params.user.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, relay, session))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, relay: Arc<RelayServer>, session: SessionKey) {
    let (mut sender, mut receiver) = socket.split();

    let Attachment { handle, mut frames } = match relay.attach(session) {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::error!(error = %e, "Failed to register WebSocket connection");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let conn_id_for_send = handle.id.clone();
    let write_timeout = relay.config().broadcast.write_timeout;

    // Task to forward snapshots from the registry channel to the socket.
    // A client that stops reading stalls the socket write; bounding it ends
    // the connection instead of leaving it half open.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = frames.recv().await {
            let frame = Message::Text(payload.to_string());
            match tokio::time::timeout(write_timeout, sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(
                        connection_id = %conn_id_for_send,
                        error = %e,
                        "WebSocket send failed, closing connection"
                    );
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        connection_id = %conn_id_for_send,
                        timeout_ms = write_timeout.as_millis() as u64,
                        "WebSocket write timed out, closing connection"
                    );
                    break;
                }
            }
        }
    });

    let conn_id_for_recv = handle.id.clone();

    // Task to watch the client side; inbound frames carry no meaning
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    tracing::debug!(connection_id = %conn_id_for_recv, "Client requested close");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        connection_id = %conn_id_for_recv,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    // Cleanup: unregister, stopping the poller if this was the last client
    relay.detach(&handle);
}
