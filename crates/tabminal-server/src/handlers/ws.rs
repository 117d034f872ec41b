//! WebSocket attach handler
//!
//! Bridges one browser connection to one session: frames from the session's
//! per-client queue flow out, parsed client frames flow in. The transport
//! pings every 10 seconds and drops clients that stop answering; session
//! frames and the greeting are entirely the core's business.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tabminal_core::Session;
use tabminal_types::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TRANSPORT_PING_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_QUEUE_DEPTH: usize = 256;

pub async fn attach(
    Path(id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.registry.get(&id).await {
        Some(session) => ws.on_upgrade(move |socket| handle_socket(socket, session)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(CLIENT_QUEUE_DEPTH);
    let client_id = session.attach(frame_tx).await;
    info!(session = %session.id(), client = client_id, "websocket attached");

    let mut ping = tokio::time::interval(TRANSPORT_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // immediate first tick
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    // Session dropped our sender (disposed or removed).
                    break;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode frame: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => session.handle_client_frame(client_id, frame).await,
                            Err(e) => debug!("ignoring malformed frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("websocket receive error: {}", e);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    info!(session = %session.id(), client = client_id, "dropping silent client");
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    session.detach(client_id).await;
    info!(session = %session.id(), client = client_id, "websocket detached");
}
