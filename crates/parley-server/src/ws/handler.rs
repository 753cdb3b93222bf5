use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{ClientMessage, ParticipantId, ServerMessage, DEFAULT_ROOM};
use serde::Deserialize;
use tokio::sync::mpsc;

const MAX_ROOM_NAME_LEN: usize = 64;

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub room: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let room = validate_room(params.room)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, room)))
}

pub(crate) fn validate_room(room: Option<String>) -> Result<String> {
    let room = match room {
        Some(room) => room.trim().to_string(),
        None => return Ok(DEFAULT_ROOM.to_string()),
    };

    if room.is_empty() {
        return Err(AppError::BadRequest("Room name must not be empty".to_string()));
    }
    if room.len() > MAX_ROOM_NAME_LEN {
        return Err(AppError::BadRequest(format!(
            "Room name longer than {} bytes",
            MAX_ROOM_NAME_LEN
        )));
    }
    Ok(room)
}

async fn handle_socket(socket: WebSocket, state: AppState, room: String) {
    let (mut sender, mut receiver) = socket.split();

    let connection_id = ParticipantId::generate();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state
        .connections
        .add_connection(connection_id.clone(), tx)
        .await;

    // Queues presence:sync for us and a join for everybody else
    state.presence.join(&room, connection_id.clone()).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", connection_id, e);
                        state
                            .connections
                            .send_to_connection(
                                &connection_id,
                                &ServerMessage::Error {
                                    message: "Invalid message format".to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                handle_client_message(&state, &connection_id, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.presence.leave(&connection_id).await;
    state.connections.remove_connection(&connection_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Participant {} disconnected from room {}", connection_id, room);
}

async fn handle_client_message(
    state: &AppState,
    connection_id: &ParticipantId,
    message: ClientMessage,
) {
    match message {
        ClientMessage::StatusChange { media } => {
            state.presence.update_status(connection_id, media).await;
        }
        ClientMessage::WebrtcSignal {
            target_socket_id,
            signal,
            kind,
            reason,
        } => {
            state
                .relay
                .relay(connection_id, &target_socket_id, signal, kind, reason)
                .await;
        }
        ClientMessage::HangupAll { reason } => {
            let Some(room) = state.presence.room_of(connection_id).await else {
                return;
            };
            tracing::info!(
                "Participant {} hung up everybody in room {} (reason: {:?})",
                connection_id,
                room,
                reason
            );
            state
                .presence
                .broadcast_to_room(
                    &room,
                    &ServerMessage::ForceDisconnect {
                        reason,
                        initiated_by: Some(connection_id.clone()),
                    },
                )
                .await;
        }
        ClientMessage::Ping => {
            state
                .connections
                .send_to_connection(connection_id, &ServerMessage::Pong)
                .await;
        }
    }
}
