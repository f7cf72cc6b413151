//! WebSocket connection handling.
//!
//! Each upgraded socket gets one task that owns both halves: it drains the
//! connection's hub queue into text frames and reads (and discards) whatever
//! the client sends. The connection is unregistered when either side ends.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use super::AppState;
use crate::hub::ConnectionId;

/// Upgrade the request and hand the socket to the hub.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let Some(mut outbound) = state.hub.open().await else {
        debug!("Hub closed, refusing WebSocket connection");
        close(&mut sink, &state, "server shutting down").await;
        return;
    };
    let id = outbound.id();
    info!(connection = %id, "Client connected");

    loop {
        tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    let frame = Message::Text(payload.to_string().into());
                    if !send(&mut sink, &state, id, frame).await {
                        break;
                    }
                }
                None => {
                    // Removed by the hub: failed delivery or shutdown
                    close(&mut sink, &state, "connection closed by server").await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    info!(connection = %id, text = %text.as_str(), "Received client message, ignoring");
                }
                Some(Ok(Message::Binary(data))) => {
                    info!(connection = %id, bytes = data.len(), "Received binary client message, ignoring");
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(connection = %id, "Client closed");
                    break;
                }
                // Ping/pong are answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(connection = %id, error = %e, "Client connection error");
                    break;
                }
            },
        }
    }

    state.hub.unregister(id).await;
}

/// Write one frame within `write_timeout`. Returns whether the socket is still usable.
async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    id: ConnectionId,
    frame: Message,
) -> bool {
    match tokio::time::timeout(state.write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(connection = %id, error = %e, "Failed to write to client");
            false
        }
        Err(_) => {
            warn!(connection = %id, timeout = ?state.write_timeout, "Client write timed out");
            false
        }
    }
}

async fn close(sink: &mut SplitSink<WebSocket, Message>, state: &AppState, reason: &str) {
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::AWAY,
        reason: reason.to_string().into(),
    }));
    let _ = tokio::time::timeout(state.write_timeout, sink.send(frame)).await;
}
