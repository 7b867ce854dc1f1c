//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use raid_common::id::{prefix, prefixed_ulid};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time;

use crate::sync::events::{BroadcastMessage, Topic};
use crate::AppState;

use super::events::{
    ClientMessage, EventName, GatewayMessage, IdentifyPayload, SelectChannelPayload,
    OP_HEARTBEAT, OP_IDENTIFY, OP_SELECT_CHANNEL,
};
use super::session::GatewaySession;

/// Heartbeat interval sent to clients in the READY payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 41250;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_IDENTIFIED: u16 = 4003;
const CLOSE_UNKNOWN_ROOM: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let identify = match time::timeout(
        Duration::from_secs(IDENTIFY_TIMEOUT_SECS),
        wait_for_identify(&mut ws_rx),
    )
    .await
    {
        Ok(Ok(payload)) => payload,
        Ok(Err((code, reason))) => {
            tracing::debug!(%reason, "gateway handshake failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Subscribe before reading snapshots so nothing published in between is
    // missed; the sequence gate drops whatever the snapshots already cover.
    let broadcast_rx = state.broadcast.subscribe();

    let mut session = GatewaySession::new(
        prefixed_ulid(prefix::GATEWAY_SESSION),
        identify.user_id,
        identify.room_id.clone(),
    );

    let ready = match enter_room(&state, &mut session, identify.room_id).await {
        Ok(snapshot) => snapshot,
        Err(reason) => {
            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ROOM, reason).await;
            return;
        }
    };

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        room_id = %session.room_id(),
        "gateway session established"
    );

    if send_message(&mut ws_tx, &GatewayMessage::dispatch(EventName::READY, ready))
        .await
        .is_err()
    {
        state.sync.leave(&session.session_id).await;
        return;
    }

    run_session(&state, &mut session, ws_tx, ws_rx, broadcast_rx).await;

    state.sync.leave(&session.session_id).await;

    tracing::info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        "gateway session ended"
    );
}

/// Read until the first IDENTIFY. Anything else closes the connection.
async fn wait_for_identify(ws_rx: &mut WsStream) -> Result<IdentifyPayload, (u16, &'static str)> {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => return Err((CLOSE_UNKNOWN_ERROR, "Client closed")),
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(?e, "ws read error during identify");
                return Err((CLOSE_UNKNOWN_ERROR, "Read error"));
            }
        };

        let client_msg: ClientMessage =
            serde_json::from_str(&text).map_err(|_| (CLOSE_UNKNOWN_ERROR, "Invalid JSON"))?;

        if client_msg.op != OP_IDENTIFY {
            return Err((CLOSE_NOT_IDENTIFIED, "Expected IDENTIFY"));
        }
        return serde_json::from_value(client_msg.d)
            .map_err(|_| (CLOSE_UNKNOWN_ERROR, "Invalid identify payload"));
    }
    Err((CLOSE_UNKNOWN_ERROR, "Connection closed before identify"))
}

/// Put `session` in `room_id` and build the snapshot the client starts from.
///
/// A room that does not exist is rejected. If the store is unreachable the
/// session still joins and the room view is left null until the next
/// broadcast.
async fn enter_room(
    state: &AppState,
    session: &mut GatewaySession,
    room_id: String,
) -> Result<Value, &'static str> {
    let room = match state.sync.room_view(&room_id).await {
        Ok(view) => Some(view),
        Err(err) if err.is_not_found() => return Err("Unknown room"),
        Err(err) => {
            tracing::warn!(%room_id, %err, "room view unavailable at join");
            None
        }
    };

    session.switch_room(room_id.clone());
    if let Some(view) = &room {
        session.mark_applied(Topic::Room(room_id.clone()), view.sequence);
    }

    state
        .sync
        .join_room(&session.session_id, &session.user_id, &room_id)
        .await;

    let presence = state.sync.presence(&room_id).await;
    session.mark_applied(Topic::Presence(room_id.clone()), presence.sequence);

    let listing = match state.sync.listing_view().await {
        Ok(view) => {
            session.mark_applied(Topic::Listing, view.sequence);
            Value::clone(&view.payload)
        }
        Err(err) => {
            tracing::warn!(%err, "listing view unavailable at join");
            Value::Null
        }
    };

    Ok(serde_json::json!({
        "session_id": session.session_id,
        "user_id": session.user_id,
        "room_id": room_id,
        "room": room.map(|v| Value::clone(&v.payload)),
        "presence": presence.users,
        "listing": listing,
        "selections": state.sync.selections(&room_id),
        "heartbeat_interval": HEARTBEAT_INTERVAL_MS,
    }))
}

/// Main session event loop: read client messages, forward broadcasts, enforce heartbeat.
async fn run_session(
    state: &AppState,
    session: &mut GatewaySession,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastMessage>>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                        break;
                    }
                };

                match client_msg.op {
                    OP_HEARTBEAT => {
                        got_heartbeat = true;
                        if !state.sync.sessions().heartbeat(&session.session_id) {
                            // Evicted by the sweeper while the socket stayed open.
                            state
                                .sync
                                .join_room(&session.session_id, &session.user_id, session.room_id())
                                .await;
                        }
                        if send_message(&mut ws_tx, &GatewayMessage::heartbeat_ack()).await.is_err() {
                            break;
                        }
                    }
                    OP_IDENTIFY => {
                        let payload: IdentifyPayload = match serde_json::from_value(client_msg.d) {
                            Ok(p) => p,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid identify payload").await;
                                break;
                            }
                        };
                        if payload.user_id != session.user_id {
                            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "User mismatch").await;
                            break;
                        }
                        let snapshot = match enter_room(state, session, payload.room_id).await {
                            Ok(snapshot) => snapshot,
                            Err(reason) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ROOM, reason).await;
                                break;
                            }
                        };
                        tracing::debug!(
                            session_id = %session.session_id,
                            room_id = %session.room_id(),
                            "gateway session switched room"
                        );
                        let switched = GatewayMessage::dispatch(EventName::ROOM_SWITCHED, snapshot);
                        if send_message(&mut ws_tx, &switched).await.is_err() {
                            break;
                        }
                    }
                    OP_SELECT_CHANNEL => {
                        let payload: SelectChannelPayload = match serde_json::from_value(client_msg.d) {
                            Ok(p) => p,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid channel selection").await;
                                break;
                            }
                        };
                        state.sync.select_channel(
                            session.room_id(),
                            &session.user_id,
                            &payload.channel_id,
                            payload.selecting,
                        );
                    }
                    _ => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                        break;
                    }
                }
            }

            result = broadcast_rx.recv() => {
                match result {
                    Ok(message) => {
                        if !session.accept(&message) {
                            continue;
                        }
                        if send_message(&mut ws_tx, &GatewayMessage::forward(&message)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            session_id = %session.session_id,
                            skipped = n,
                            "gateway session lagged behind broadcast"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(session_id = %session.session_id, "heartbeat timeout, closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Serialize and send one message. An encode failure is logged and skipped;
/// only a dead socket is an error.
async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(err) => {
            tracing::error!(%err, "failed to encode gateway message");
            Ok(())
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
