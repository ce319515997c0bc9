//! WebSocket transport for the session protocol.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::PeerAddr;
use super::connection::{flush, Connection, ConnectionConfig, Flow};
use super::router::AppState;
use crate::protocol::ServerMessage;
use crate::session::SessionManager;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
) -> impl IntoResponse {
    ws.max_message_size(state.connection.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.sessions, state.connection, peer))
}

/// Drive one WebSocket client until either side closes.
async fn handle_socket(
    socket: WebSocket,
    manager: Arc<SessionManager>,
    config: ConnectionConfig,
    peer: String,
) {
    info!(peer = %peer, "websocket client connected");
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(sink, rx));

    let mut connection = Connection::new(manager, tx, peer.clone(), config);
    let mut first = true;

    loop {
        let next = if first {
            first = false;
            match tokio::time::timeout(config.handshake_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(peer = %peer, "no handshake within {:?}", config.handshake_timeout);
                    break;
                }
            }
        } else {
            stream.next().await
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(peer = %peer, "websocket read error: {}", e);
                break;
            }
        };

        if connection.handle_frame(text.as_str()).await == Flow::Close {
            break;
        }
    }

    connection.finish().await;
    flush(writer, &peer).await;
    info!(peer = %peer, "websocket client disconnected");
}

/// Forward queued server messages as text frames.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = rx.recv().await {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("dropping unserializable message: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
