use super::backend::{
    ConnectionState, IceConnectionState, MediaKind, PeerBackend, RemoteTrackInfo, TransceiverId,
};
use crate::media::MediaElement;
use parley_protocol::{IceCandidate, ParticipantId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A renegotiation that could not run yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredRenegotiation {
    pub reason: String,
    pub force: bool,
}

/// Negotiation state for one remote participant
pub struct ParticipantConnection {
    pub remote_id: ParticipantId,
    pub peer: Arc<dyn PeerBackend>,
    pub media_element: Arc<dyn MediaElement>,
    /// Candidates that arrived before any remote description
    pub pending_candidates: VecDeque<IceCandidate>,
    pub connected: bool,
    pub video_enabled: bool,
    pub audio_transceiver: Option<TransceiverId>,
    pub video_transceiver: Option<TransceiverId>,
    pub renegotiating: bool,
    pub pending_renegotiation: Option<DeferredRenegotiation>,
    pub is_initiator: bool,
    pub remote_tracks: HashMap<String, RemoteTrackInfo>,
    pub ice_state: IceConnectionState,
    pub connection_state: ConnectionState,
}

impl ParticipantConnection {
    pub fn new(
        remote_id: ParticipantId,
        peer: Arc<dyn PeerBackend>,
        media_element: Arc<dyn MediaElement>,
        is_initiator: bool,
    ) -> Self {
        Self {
            remote_id,
            peer,
            media_element,
            pending_candidates: VecDeque::new(),
            connected: false,
            video_enabled: false,
            audio_transceiver: None,
            video_transceiver: None,
            renegotiating: false,
            pending_renegotiation: None,
            is_initiator,
            remote_tracks: HashMap::new(),
            ice_state: IceConnectionState::New,
            connection_state: ConnectionState::New,
        }
    }

    /// Recompute `video_enabled`; returns true when it changed.
    pub fn refresh_video_enabled(&mut self) -> bool {
        let enabled = self
            .remote_tracks
            .values()
            .any(|t| t.kind == MediaKind::Video && t.is_active());
        let changed = enabled != self.video_enabled;
        self.video_enabled = enabled;
        changed
    }

    /// Remember a deferred renegotiation; a forced request stays forced.
    pub fn defer_renegotiation(&mut self, reason: &str, force: bool) {
        let force = force
            || self
                .pending_renegotiation
                .as_ref()
                .is_some_and(|p| p.force);
        self.pending_renegotiation = Some(DeferredRenegotiation {
            reason: reason.to_string(),
            force,
        });
    }

    /// Fold connection-state and ICE-state into the `connected` flag.
    pub fn refresh_connected(&mut self) -> bool {
        let down = matches!(
            self.ice_state,
            IceConnectionState::Disconnected | IceConnectionState::Failed | IceConnectionState::Closed
        ) || matches!(
            self.connection_state,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        );
        let up =
            self.ice_state.is_connected() || self.connection_state == ConnectionState::Connected;

        let connected = if down { false } else { up || self.connected };
        let changed = connected != self.connected;
        self.connected = connected;
        changed
    }
}
