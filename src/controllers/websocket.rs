use crate::models::events::{ClientEvent, ServerEvent};
use crate::services::engine::SessionEngine;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, warn};
use uuid::Uuid;

pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task pair per endpoint: a forwarder draining the registry mailbox
/// to the socket (per-endpoint delivery order is the send order), and a
/// receive loop with the idle timeout on every frame.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let endpoint_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("outbound event serialization failed: {}", e),
            }
        }
    });

    let idle_timeout = state.config.idle_timeout();
    let recv_state = state.clone();
    let recv_tx = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    dispatch_frame(&recv_state, endpoint_id, &recv_tx, &text).await;
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(_))) => {
                    // Ping/pong/binary; pongs are handled by axum.
                }
                Ok(Some(Err(_))) => break,
                Ok(None) => break,
                Err(_) => {
                    warn!(endpoint = %endpoint_id, "idle timeout, forcing disconnect");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    SessionEngine::handle_disconnect(&state, endpoint_id).await;
}

/// Parses and dispatches one frame. Handler errors become `error`
/// frames; a handler panic is caught and logged so one poisoned event
/// cannot tear the endpoint's session down.
async fn dispatch_frame(
    state: &AppState,
    endpoint_id: Uuid,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    text: &str,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(endpoint = %endpoint_id, "invalid event payload: {}", e);
            let _ = tx.send(ServerEvent::error("invalid event payload"));
            return;
        }
    };

    let dispatched = AssertUnwindSafe(SessionEngine::dispatch(state, endpoint_id, tx, event))
        .catch_unwind()
        .await;

    match dispatched {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let _ = tx.send(ServerEvent::error(err.to_string()));
        }
        Err(_) => {
            error!(endpoint = %endpoint_id, "event handler panicked");
            let _ = tx.send(ServerEvent::error("internal error"));
        }
    }
}
