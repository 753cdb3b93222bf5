use serde::{Deserialize, Serialize};

use crate::signal::{ProtocolError, SignalKind, SignalMessage};
use crate::types::{MediaPatch, ParticipantId, PresenceRecord};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Local camera / microphone state changed
    #[serde(rename = "status:change")]
    StatusChange { media: MediaPatch },

    /// Signaling payload for one other participant
    #[serde(rename = "webrtc-signal", rename_all = "camelCase")]
    WebrtcSignal {
        target_socket_id: ParticipantId,
        signal: serde_json::Value,
        #[serde(rename = "type")]
        kind: SignalKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Ask the server to disconnect everybody in the room
    #[serde(rename = "conference:hangup-all", rename_all = "camelCase")]
    HangupAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Ping to keep connection alive
    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    /// Wrap a typed signal for delivery to `target`.
    pub fn signal(
        target: ParticipantId,
        message: &SignalMessage,
        reason: Option<String>,
    ) -> Result<Self, ProtocolError> {
        Ok(ClientMessage::WebrtcSignal {
            target_socket_id: target,
            signal: message.to_wire()?,
            kind: message.kind(),
            reason,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Leave,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    /// Full room snapshot, sent once to a participant right after it joins
    #[serde(rename = "presence:sync", rename_all = "camelCase")]
    PresenceSync {
        participants: Vec<PresenceRecord>,
        self_id: ParticipantId,
    },

    /// Someone joined or left the room
    #[serde(rename = "presence:update", rename_all = "camelCase")]
    PresenceUpdate {
        action: PresenceAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant: Option<PresenceRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<ParticipantId>,
    },

    /// Another participant's media state changed
    #[serde(rename = "status:update")]
    StatusUpdate { id: ParticipantId, media: MediaPatch },

    /// Signaling payload relayed from another participant
    #[serde(rename = "webrtc-signal", rename_all = "camelCase")]
    WebrtcSignal {
        from_socket_id: ParticipantId,
        signal: serde_json::Value,
        #[serde(rename = "type")]
        kind: SignalKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Everybody in the room must hang up
    #[serde(rename = "conference:force-disconnect", rename_all = "camelCase")]
    ForceDisconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiated_by: Option<ParticipantId>,
    },

    /// Pong response to ping
    #[serde(rename = "pong")]
    Pong,

    /// Error message
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn joined(participant: PresenceRecord) -> Self {
        ServerMessage::PresenceUpdate {
            action: PresenceAction::Join,
            participant: Some(participant),
            participant_id: None,
        }
    }

    pub fn left(participant_id: ParticipantId) -> Self {
        ServerMessage::PresenceUpdate {
            action: PresenceAction::Leave,
            participant: None,
            participant_id: Some(participant_id),
        }
    }
}
