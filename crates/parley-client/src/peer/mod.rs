//! Mesh negotiation
//!
//! One `ParticipantConnection` per remote participant. The manager is owned
//! by the session task, so offer/answer handling for a peer never interleaves
//! with another handler for the same peer; backend callbacks come back in as
//! queued `PeerEvent`s.

pub mod backend;
mod connection;
mod election;
pub mod rtc;
#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    ConnectionState, IceConnectionState, MediaKind, PeerBackend, PeerEvent, PeerEventSender,
    PeerFactory, RemoteTrackInfo, SignalingState, TransceiverDirection, TransceiverId,
};
pub use connection::{DeferredRenegotiation, ParticipantConnection};
pub use election::is_initiator;

use crate::error::{ClientError, Result};
use crate::media::{LocalMedia, LocalTrack, MediaElementFactory, PlaybackUnlockManager};
use crate::session::SessionInput;
use parley_protocol::{
    ClientMessage, IceCandidate, IceServer, ParticipantId, SessionDescription, SignalMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct PeerConnectionManager {
    self_id: Option<ParticipantId>,
    ice_servers: Vec<IceServer>,
    factory: Arc<dyn PeerFactory>,
    elements: Arc<dyn MediaElementFactory>,
    playback: PlaybackUnlockManager,
    connections: HashMap<ParticipantId, ParticipantConnection>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl PeerConnectionManager {
    pub fn new(
        ice_servers: Vec<IceServer>,
        factory: Arc<dyn PeerFactory>,
        elements: Arc<dyn MediaElementFactory>,
        playback: PlaybackUnlockManager,
        signals: mpsc::UnboundedSender<ClientMessage>,
        inputs: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            self_id: None,
            ice_servers,
            factory,
            elements,
            playback,
            connections: HashMap::new(),
            signals,
            inputs,
        }
    }

    pub fn set_self_id(&mut self, self_id: Option<ParticipantId>) {
        self.self_id = self_id;
    }

    pub fn self_id(&self) -> Option<&ParticipantId> {
        self.self_id.as_ref()
    }

    pub fn get(&self, remote_id: &ParticipantId) -> Option<&ParticipantConnection> {
        self.connections.get(remote_id)
    }

    pub fn contains(&self, remote_id: &ParticipantId) -> bool {
        self.connections.contains_key(remote_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connected peers, in id order.
    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create the connection to `remote_id`; the initiator also sends the
    /// first offer. Idempotent.
    pub async fn connect_to_peer(
        &mut self,
        remote_id: &ParticipantId,
        is_initiator: bool,
        local: &LocalMedia,
    ) -> Result<()> {
        self.open(remote_id, is_initiator, is_initiator, local).await
    }

    async fn open(
        &mut self,
        remote_id: &ParticipantId,
        is_initiator: bool,
        send_offer: bool,
        local: &LocalMedia,
    ) -> Result<()> {
        if self.connections.contains_key(remote_id) {
            tracing::debug!("Already have a connection to {}", remote_id);
            return Ok(());
        }
        if self.self_id.as_ref() == Some(remote_id) {
            tracing::debug!("Not connecting to ourselves");
            return Ok(());
        }

        tracing::info!(
            "Connecting to {} (initiator: {})",
            remote_id,
            is_initiator
        );

        let events = PeerEventSender::new(remote_id.clone(), self.inputs.clone());
        let peer = self.factory.create(&self.ice_servers, events).await?;

        let (audio, video) = match attach_local_media(peer.as_ref(), local).await {
            Ok(transceivers) => transceivers,
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    tracing::warn!("Failed to close half-built connection: {}", close_err);
                }
                return Err(e);
            }
        };

        let element = self.elements.create(remote_id);
        let mut connection =
            ParticipantConnection::new(remote_id.clone(), peer, element, is_initiator);
        connection.audio_transceiver = Some(audio);
        connection.video_transceiver = Some(video);
        self.connections.insert(remote_id.clone(), connection);

        if send_offer {
            self.send_offer(remote_id, None).await?;
        }
        Ok(())
    }

    /// Apply one signaling message from `from`. Failures are logged and only
    /// affect that peer.
    pub async fn handle_signal(
        &mut self,
        from: &ParticipantId,
        message: SignalMessage,
        reason: Option<String>,
        local: &LocalMedia,
    ) {
        let kind = message.kind();
        let result = match message {
            SignalMessage::Offer(description) => {
                match self.ensure_connection(from, local).await {
                    Ok(()) => self.handle_offer(from, description).await,
                    Err(e) => Err(e),
                }
            }
            SignalMessage::Answer(description) => self.handle_answer(from, description).await,
            SignalMessage::IceCandidate(candidate) => {
                self.handle_remote_candidate(from, candidate).await
            }
            SignalMessage::RenegotiateRequest => {
                let reason = reason.as_deref().unwrap_or("renegotiate-request");
                tracing::debug!("{} asked us to renegotiate ({})", from, reason);
                self.renegotiate_with_peer(from, reason, true).await
            }
        };

        if let Err(e) = result {
            tracing::error!("Handling {:?} from {} failed: {}", kind, from, e);
        }
    }

    /// An offer can arrive before we learned about the sender.
    async fn ensure_connection(&mut self, from: &ParticipantId, local: &LocalMedia) -> Result<()> {
        if self.connections.contains_key(from) {
            return Ok(());
        }
        let elected = self
            .self_id
            .as_ref()
            .is_some_and(|self_id| is_initiator(self_id, from));
        self.open(from, elected, false, local).await
    }

    async fn handle_offer(
        &mut self,
        from: &ParticipantId,
        description: SessionDescription,
    ) -> Result<()> {
        let connection = self
            .connections
            .get(from)
            .ok_or_else(|| ClientError::UnknownPeer(from.clone()))?;
        let peer = connection.peer.clone();

        if peer.signaling_state() == SignalingState::HaveLocalOffer {
            if connection.is_initiator {
                tracing::info!("Offer collision with {}: keeping ours", from);
                return Ok(());
            }
            tracing::info!("Offer collision with {}: rolling back ours", from);
            peer.rollback().await?;
        }

        peer.set_remote_description(description).await?;
        self.drain_pending_candidates(from).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.send_signal(from, SignalMessage::Answer(answer), None)
    }

    async fn handle_answer(
        &mut self,
        from: &ParticipantId,
        description: SessionDescription,
    ) -> Result<()> {
        let Some(connection) = self.connections.get(from) else {
            tracing::warn!("Answer from {} without a connection", from);
            return Ok(());
        };
        let peer = connection.peer.clone();

        let state = peer.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::warn!("Ignoring answer from {} in state {}", from, state);
            return Ok(());
        }

        peer.set_remote_description(description).await?;
        if let Some(connection) = self.connections.get_mut(from) {
            connection.connected = true;
        }
        self.drain_pending_candidates(from).await;
        Ok(())
    }

    async fn handle_remote_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let Some(connection) = self.connections.get(from) else {
            tracing::warn!("Candidate from {} without a connection", from);
            return Ok(());
        };
        let peer = connection.peer.clone();

        if peer.has_remote_description().await {
            peer.add_ice_candidate(candidate).await
        } else {
            if let Some(connection) = self.connections.get_mut(from) {
                connection.pending_candidates.push_back(candidate);
                tracing::debug!(
                    "Queued candidate from {} ({} waiting)",
                    from,
                    connection.pending_candidates.len()
                );
            }
            Ok(())
        }
    }

    async fn drain_pending_candidates(&mut self, remote_id: &ParticipantId) {
        let Some(connection) = self.connections.get_mut(remote_id) else {
            return;
        };
        let queued = std::mem::take(&mut connection.pending_candidates);
        let peer = connection.peer.clone();

        if !queued.is_empty() {
            tracing::debug!("Applying {} queued candidates for {}", queued.len(), remote_id);
        }
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Queued candidate for {} rejected: {}", remote_id, e);
            }
        }
    }

    /// Start a new offer/answer round with `remote_id`.
    ///
    /// Only the initiator offers unless `force`; the other side asks the
    /// initiator instead. Requests arriving mid-negotiation collapse into one
    /// deferred attempt.
    pub async fn renegotiate_with_peer(
        &mut self,
        remote_id: &ParticipantId,
        reason: &str,
        force: bool,
    ) -> Result<()> {
        let Some(connection) = self.connections.get_mut(remote_id) else {
            tracing::debug!("No connection to {} to renegotiate", remote_id);
            return Ok(());
        };

        if !connection.is_initiator && !force {
            tracing::debug!("Asking {} to renegotiate ({})", remote_id, reason);
            return self.send_signal(
                remote_id,
                SignalMessage::RenegotiateRequest,
                Some(reason.to_string()),
            );
        }

        let state = connection.peer.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(
                "Deferring renegotiation with {} ({}): state {}",
                remote_id,
                reason,
                state
            );
            connection.defer_renegotiation(reason, force);
            return Ok(());
        }
        if connection.renegotiating {
            connection.defer_renegotiation(reason, force);
            return Ok(());
        }

        connection.renegotiating = true;
        tracing::info!("Renegotiating with {} ({})", remote_id, reason);
        let result = self.send_offer(remote_id, Some(reason)).await;

        let deferred = self.connections.get_mut(remote_id).and_then(|connection| {
            connection.renegotiating = false;
            connection.pending_renegotiation.take()
        });
        if let Some(deferred) = deferred {
            self.schedule_retry(remote_id, deferred);
        }

        result
    }

    pub async fn renegotiate_all_peers(&mut self, reason: &str, force: bool) {
        for remote_id in self.peer_ids() {
            if let Err(e) = self.renegotiate_with_peer(&remote_id, reason, force).await {
                tracing::error!("Renegotiation with {} failed: {}", remote_id, e);
            }
        }
    }

    /// Send the camera track to every peer.
    pub async fn attach_local_video(&mut self, track: &LocalTrack) {
        for remote_id in self.peer_ids() {
            if let Err(e) = self.attach_video_to(&remote_id, track).await {
                tracing::error!("Failed to attach camera for {}: {}", remote_id, e);
            }
        }
        self.renegotiate_all_peers("enable-video", true).await;
    }

    async fn attach_video_to(&mut self, remote_id: &ParticipantId, track: &LocalTrack) -> Result<()> {
        let connection = self
            .connections
            .get(remote_id)
            .ok_or_else(|| ClientError::UnknownPeer(remote_id.clone()))?;
        let peer = connection.peer.clone();

        match connection.video_transceiver {
            Some(transceiver) => {
                peer.replace_track(transceiver, Some(track)).await?;
                peer.set_direction(transceiver, TransceiverDirection::Sendrecv)
                    .await?;
            }
            None => {
                let transceiver = peer
                    .add_track(track, TransceiverDirection::Sendrecv)
                    .await?;
                if let Some(connection) = self.connections.get_mut(remote_id) {
                    connection.video_transceiver = Some(transceiver);
                }
            }
        }
        Ok(())
    }

    /// Stop sending video to every peer while still receiving theirs.
    pub async fn detach_local_video(&mut self) {
        for remote_id in self.peer_ids() {
            let Some(connection) = self.connections.get(&remote_id) else {
                continue;
            };
            let Some(transceiver) = connection.video_transceiver else {
                continue;
            };
            let peer = connection.peer.clone();

            if let Err(e) = stop_sending(peer.as_ref(), transceiver).await {
                tracing::error!("Failed to detach camera for {}: {}", remote_id, e);
            }
        }
        self.renegotiate_all_peers("disable-video", true).await;
    }

    /// Close and forget the connection to `remote_id`.
    pub async fn remove_peer(&mut self, remote_id: &ParticipantId) -> bool {
        let Some(connection) = self.connections.remove(remote_id) else {
            return false;
        };

        tracing::info!("Closing connection to {}", remote_id);
        for track_id in connection.remote_tracks.keys() {
            connection.media_element.detach(track_id);
        }
        self.playback.cancel(&connection.media_element).await;
        if let Err(e) = connection.peer.close().await {
            tracing::warn!("Error closing connection to {}: {}", remote_id, e);
        }
        true
    }

    pub async fn close_all(&mut self) {
        for remote_id in self.peer_ids() {
            self.remove_peer(&remote_id).await;
        }
    }

    /// Apply a backend callback. Returns true when the peer's tile changed.
    pub async fn handle_peer_event(&mut self, remote_id: &ParticipantId, event: PeerEvent) -> bool {
        if !self.connections.contains_key(remote_id) {
            tracing::debug!("Dropping {:?} for closed connection {}", event, remote_id);
            return false;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) =
                    self.send_signal(remote_id, SignalMessage::IceCandidate(candidate), None)
                {
                    tracing::warn!("Could not forward candidate to {}: {}", remote_id, e);
                }
                false
            }
            PeerEvent::RemoteTrack(track) => self.on_remote_track(remote_id, track).await,
            PeerEvent::RemoteTrackMuted { track_id, muted } => {
                let Some(connection) = self.connections.get_mut(remote_id) else {
                    return false;
                };
                if let Some(track) = connection.remote_tracks.get_mut(&track_id) {
                    track.muted = muted;
                }
                connection.refresh_video_enabled()
            }
            PeerEvent::RemoteTrackEnded { track_id } => {
                let Some(connection) = self.connections.get_mut(remote_id) else {
                    return false;
                };
                if connection.remote_tracks.remove(&track_id).is_some() {
                    tracing::debug!("Track {} from {} ended", track_id, remote_id);
                    connection.media_element.detach(&track_id);
                }
                connection.refresh_video_enabled()
            }
            PeerEvent::ConnectionState(state) => {
                let Some(connection) = self.connections.get_mut(remote_id) else {
                    return false;
                };
                tracing::info!("Connection to {} is {:?}", remote_id, state);
                connection.connection_state = state;
                connection.refresh_connected()
            }
            PeerEvent::IceConnectionState(state) => {
                let Some(connection) = self.connections.get_mut(remote_id) else {
                    return false;
                };
                if matches!(state, IceConnectionState::Failed | IceConnectionState::Disconnected) {
                    tracing::warn!("ICE to {} is {:?}", remote_id, state);
                } else {
                    tracing::debug!("ICE to {} is {:?}", remote_id, state);
                }
                connection.ice_state = state;
                connection.refresh_connected()
            }
            PeerEvent::SignalingState(state) => {
                tracing::debug!("Signaling with {} is {}", remote_id, state);
                if state == SignalingState::Stable {
                    self.retry_deferred(remote_id).await;
                }
                false
            }
        }
    }

    async fn on_remote_track(&mut self, remote_id: &ParticipantId, track: RemoteTrackInfo) -> bool {
        let Some(connection) = self.connections.get_mut(remote_id) else {
            return false;
        };

        tracing::info!(
            "Receiving {:?} track {} from {}",
            track.kind,
            track.track_id,
            remote_id
        );
        connection.media_element.attach(&track);
        connection.remote_tracks.insert(track.track_id.clone(), track);
        let changed = connection.refresh_video_enabled();

        let element = connection.media_element.clone();
        self.playback
            .force_play(element, &format!("remote-{}", remote_id), false)
            .await;
        changed
    }

    async fn retry_deferred(&mut self, remote_id: &ParticipantId) {
        let deferred = match self.connections.get_mut(remote_id) {
            Some(connection) if !connection.renegotiating => connection.pending_renegotiation.take(),
            _ => None,
        };
        if let Some(deferred) = deferred {
            tracing::debug!("Running deferred renegotiation with {}", remote_id);
            if let Err(e) = self
                .renegotiate_with_peer(remote_id, &deferred.reason, deferred.force)
                .await
            {
                tracing::error!("Deferred renegotiation with {} failed: {}", remote_id, e);
            }
        }
    }

    fn schedule_retry(&self, remote_id: &ParticipantId, deferred: DeferredRenegotiation) {
        let input = SessionInput::RetryRenegotiation {
            peer_id: remote_id.clone(),
            reason: deferred.reason,
            force: deferred.force,
        };
        if self.inputs.send(input).is_err() {
            tracing::debug!("Session gone, dropping renegotiation retry for {}", remote_id);
        }
    }

    async fn send_offer(&mut self, remote_id: &ParticipantId, reason: Option<&str>) -> Result<()> {
        let peer = self
            .connections
            .get(remote_id)
            .map(|connection| connection.peer.clone())
            .ok_or_else(|| ClientError::UnknownPeer(remote_id.clone()))?;

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        tracing::debug!("Sending offer to {} ({:?})", remote_id, reason);
        self.send_signal(
            remote_id,
            SignalMessage::Offer(offer),
            reason.map(str::to_string),
        )
    }

    fn send_signal(
        &self,
        target: &ParticipantId,
        message: SignalMessage,
        reason: Option<String>,
    ) -> Result<()> {
        let message = ClientMessage::signal(target.clone(), &message, reason)?;
        self.signals
            .send(message)
            .map_err(|_| ClientError::SignalingClosed)
    }
}

async fn attach_local_media(
    peer: &dyn PeerBackend,
    local: &LocalMedia,
) -> Result<(TransceiverId, TransceiverId)> {
    let audio = match &local.audio {
        Some(track) if track.is_live() => {
            peer.add_track(track, TransceiverDirection::Sendrecv).await?
        }
        _ => {
            peer.add_transceiver(MediaKind::Audio, TransceiverDirection::Recvonly)
                .await?
        }
    };
    let video = match &local.video {
        Some(track) if track.is_live() => {
            peer.add_track(track, TransceiverDirection::Sendrecv).await?
        }
        _ => {
            peer.add_transceiver(MediaKind::Video, TransceiverDirection::Sendrecv)
                .await?
        }
    };
    Ok((audio, video))
}

async fn stop_sending(peer: &dyn PeerBackend, transceiver: TransceiverId) -> Result<()> {
    peer.replace_track(transceiver, None).await?;
    peer.set_direction(transceiver, TransceiverDirection::Recvonly)
        .await
}
