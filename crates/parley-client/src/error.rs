use crate::peer::MediaKind;
use parley_protocol::{ParticipantId, ProtocolError};
use thiserror::Error;

/// Failures while acquiring local capture devices
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to use the {0} was denied")]
    PermissionDenied(MediaKind),

    #[error("No {0} device found")]
    NotFound(MediaKind),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("No connection to peer {0}")]
    UnknownPeer(ParticipantId),

    #[error("Signaling channel closed")]
    SignalingClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
