//! Scripted in-memory peer backend.
//!
//! Follows the offer/answer state machine closely enough to exercise glare,
//! rollback, candidate queueing and renegotiation. Rollback starts over on a
//! fresh connection, the way `RtcPeer` has to: everything negotiated so far
//! is dropped and remote tracks end. Descriptions carry a tiny
//! text body listing which tracks each side sends, so applying a remote
//! description raises the same track events a real stack would.

use super::backend::{
    ConnectionState, IceConnectionState, MediaKind, PeerBackend, PeerEvent, PeerEventSender,
    PeerFactory, RemoteTrackInfo, SignalingState, TransceiverDirection, TransceiverId,
};
use crate::error::{ClientError, Result};
use crate::media::LocalTrack;
use async_trait::async_trait;
use parley_protocol::{IceCandidate, IceServer, ParticipantId, SdpType, SessionDescription};
use std::sync::{Arc, Mutex};

struct FakeTransceiver {
    kind: MediaKind,
    direction: TransceiverDirection,
    track: Option<String>,
}

impl FakeTransceiver {
    fn sending(&self) -> Option<&str> {
        match self.direction {
            TransceiverDirection::Sendrecv | TransceiverDirection::Sendonly => {
                self.track.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct FakeState {
    signaling: Option<SignalingState>,
    transceivers: Vec<FakeTransceiver>,
    has_local: bool,
    has_remote: bool,
    version: usize,
    offers_created: usize,
    answers_created: usize,
    rollbacks: usize,
    candidates: Vec<IceCandidate>,
    remote_audio: Option<String>,
    remote_video: Option<String>,
    gathered: bool,
    connected: bool,
    closed: bool,
}

pub(crate) struct FakePeer {
    events: PeerEventSender,
    state: Mutex<FakeState>,
}

impl FakePeer {
    fn new(events: PeerEventSender) -> Self {
        Self {
            events,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn offers_created(&self) -> usize {
        self.state.lock().unwrap().offers_created
    }

    pub(crate) fn answers_created(&self) -> usize {
        self.state.lock().unwrap().answers_created
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub(crate) fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn direction(&self, id: TransceiverId) -> TransceiverDirection {
        self.state.lock().unwrap().transceivers[id.0].direction
    }

    pub(crate) fn sent_track(&self, id: TransceiverId) -> Option<String> {
        self.state.lock().unwrap().transceivers[id.0].track.clone()
    }

    pub(crate) fn transceiver_count(&self) -> usize {
        self.state.lock().unwrap().transceivers.len()
    }

    /// Raise a backend event as if the stack had observed it.
    pub(crate) fn emit(&self, event: PeerEvent) {
        self.events.send(event);
    }

    fn describe(state: &FakeState, sdp_type: SdpType) -> SessionDescription {
        let sent = |kind: MediaKind| {
            state
                .transceivers
                .iter()
                .filter(|t| t.kind == kind)
                .find_map(|t| t.sending())
                .unwrap_or("-")
                .to_string()
        };
        SessionDescription {
            sdp_type,
            sdp: format!(
                "fake v{}\naudio {}\nvideo {}\n",
                state.version,
                sent(MediaKind::Audio),
                sent(MediaKind::Video)
            ),
        }
    }

    fn transition(&self, state: &mut FakeState, next: SignalingState) {
        state.signaling = Some(next);
        self.events.send(PeerEvent::SignalingState(next));

        if next == SignalingState::Stable
            && state.has_local
            && state.has_remote
            && !state.connected
        {
            state.connected = true;
            self.events
                .send(PeerEvent::IceConnectionState(IceConnectionState::Connected));
            self.events
                .send(PeerEvent::ConnectionState(ConnectionState::Connected));
        }
    }

    fn gather(&self, state: &mut FakeState) {
        if state.gathered {
            return;
        }
        state.gathered = true;
        for index in 0..2u16 {
            self.events.send(PeerEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host",
                    index, index, index
                ),
                sdp_mid: Some(index.to_string()),
                sdp_mline_index: Some(index),
                username_fragment: None,
            }));
        }
    }

    /// Announce remote tracks described by `sdp`.
    fn apply_remote_tracks(&self, state: &mut FakeState, sdp: &str) {
        for line in sdp.lines() {
            let (kind, announced) = match line.split_once(' ') {
                Some(("audio", id)) => (MediaKind::Audio, id),
                Some(("video", id)) => (MediaKind::Video, id),
                _ => continue,
            };
            let slot = match kind {
                MediaKind::Audio => &mut state.remote_audio,
                MediaKind::Video => &mut state.remote_video,
            };
            let announced = (announced != "-").then(|| announced.to_string());
            if *slot == announced {
                continue;
            }
            if let Some(ended) = slot.take() {
                self.events.send(PeerEvent::RemoteTrackEnded { track_id: ended });
            }
            if let Some(track_id) = announced {
                self.events.send(PeerEvent::RemoteTrack(RemoteTrackInfo::new(
                    track_id.clone(),
                    "remote-stream",
                    kind,
                )));
                *slot = Some(track_id);
            }
        }
    }

    fn invalid(state: &FakeState, action: &str) -> ClientError {
        ClientError::Negotiation(format!(
            "cannot {} in state {}",
            action,
            state.signaling.unwrap_or(SignalingState::Stable)
        ))
    }
}

#[async_trait]
impl PeerBackend for FakePeer {
    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock().unwrap();
        if state.closed {
            return SignalingState::Closed;
        }
        state.signaling.unwrap_or(SignalingState::Stable)
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().unwrap().has_remote
    }

    async fn add_track(
        &self,
        track: &LocalTrack,
        direction: TransceiverDirection,
    ) -> Result<TransceiverId> {
        let mut state = self.state.lock().unwrap();
        state.transceivers.push(FakeTransceiver {
            kind: track.kind(),
            direction,
            track: Some(track.id().to_string()),
        });
        Ok(TransceiverId(state.transceivers.len() - 1))
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<TransceiverId> {
        let mut state = self.state.lock().unwrap();
        state.transceivers.push(FakeTransceiver {
            kind,
            direction,
            track: None,
        });
        Ok(TransceiverId(state.transceivers.len() - 1))
    }

    async fn replace_track(
        &self,
        transceiver: TransceiverId,
        track: Option<&LocalTrack>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.transceivers[transceiver.0].track = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn set_direction(
        &self,
        transceiver: TransceiverId,
        direction: TransceiverDirection,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.transceivers[transceiver.0].direction = direction;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Self::invalid(&state, "create offer"));
        }
        state.version += 1;
        state.offers_created += 1;
        Ok(Self::describe(&state, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock().unwrap();
        if state.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(Self::invalid(&state, "create answer"));
        }
        state.version += 1;
        state.answers_created += 1;
        Ok(Self::describe(&state, SdpType::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        let next = match (description.sdp_type, current) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            _ => return Err(Self::invalid(&state, "set local description")),
        };
        state.has_local = true;
        self.gather(&mut state);
        self.transition(&mut state, next);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        let next = match (description.sdp_type, current) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            _ => return Err(Self::invalid(&state, "set remote description")),
        };
        state.has_remote = true;
        self.apply_remote_tracks(&mut state, &description.sdp);
        self.transition(&mut state, next);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.signaling != Some(SignalingState::HaveLocalOffer) {
            return Err(Self::invalid(&state, "roll back"));
        }
        state.rollbacks += 1;

        for ended in [state.remote_audio.take(), state.remote_video.take()]
            .into_iter()
            .flatten()
        {
            self.events.send(PeerEvent::RemoteTrackEnded { track_id: ended });
        }
        // A fresh connection starts out stable without announcing it.
        state.signaling = Some(SignalingState::Stable);
        state.has_local = false;
        state.has_remote = false;
        state.gathered = false;
        state.connected = false;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.has_remote {
            return Err(Self::invalid(&state, "add candidate without remote description"));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Hands out `FakePeer`s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct FakeFactory {
    peers: Mutex<Vec<(ParticipantId, Arc<FakePeer>)>>,
}

impl FakeFactory {
    /// The most recently created backend for `remote`.
    pub(crate) fn peer(&self, remote: &ParticipantId) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == remote)
            .map(|(_, peer)| peer.clone())
            .unwrap_or_else(|| panic!("no backend created for {}", remote))
    }

    pub(crate) fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerBackend>> {
        let remote = events.peer_id().clone();
        let peer = Arc::new(FakePeer::new(events));
        self.peers.lock().unwrap().push((remote, peer.clone()));
        Ok(peer)
    }
}
