//! The seam between negotiation logic and a concrete WebRTC stack.
//!
//! `PeerConnectionManager` only talks to `PeerBackend`; callbacks raised by a
//! backend are never applied in place, they are queued as `SessionInput`s so
//! that every state change happens on the session task.

use crate::error::Result;
use crate::media::LocalTrack;
use crate::session::SessionInput;
use async_trait::async_trait;
use parley_protocol::{IceCandidate, IceServer, ParticipantId, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("microphone"),
            MediaKind::Video => f.write_str("camera"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
}

/// Backend-local handle to one transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransceiverId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

/// What the backend knows about one incoming track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub live: bool,
    pub enabled: bool,
    pub muted: bool,
}

impl RemoteTrackInfo {
    pub fn new(track_id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            track_id: track_id.into(),
            stream_id: stream_id.into(),
            kind,
            live: true,
            enabled: true,
            muted: false,
        }
    }

    /// Live, enabled and currently delivering media.
    pub fn is_active(&self) -> bool {
        self.live && self.enabled && !self.muted
    }
}

/// Callbacks raised by a backend for one remote peer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    RemoteTrack(RemoteTrackInfo),
    RemoteTrackMuted { track_id: String, muted: bool },
    RemoteTrackEnded { track_id: String },
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
    SignalingState(SignalingState),
}

/// Routes backend callbacks for one remote peer into the session queue.
#[derive(Clone)]
pub struct PeerEventSender {
    peer_id: ParticipantId,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl PeerEventSender {
    pub fn new(peer_id: ParticipantId, inputs: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { peer_id, inputs }
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn send(&self, event: PeerEvent) {
        let input = SessionInput::Peer {
            peer_id: self.peer_id.clone(),
            event,
        };
        if self.inputs.send(input).is_err() {
            tracing::debug!("Session gone, dropping event for {}", self.peer_id);
        }
    }
}

/// One peer connection, as seen by the negotiation logic.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    /// Add a transceiver that sends `track`.
    async fn add_track(
        &self,
        track: &LocalTrack,
        direction: TransceiverDirection,
    ) -> Result<TransceiverId>;

    /// Add a transceiver with no local track.
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<TransceiverId>;

    async fn replace_track(
        &self,
        transceiver: TransceiverId,
        track: Option<&LocalTrack>,
    ) -> Result<()>;

    async fn set_direction(
        &self,
        transceiver: TransceiverId,
        direction: TransceiverDirection,
    ) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Abandon a pending local offer and return to `stable`.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates backends for newly discovered peers.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerBackend>>;
}
