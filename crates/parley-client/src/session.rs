//! One conference session
//!
//! `ConferenceSession` owns every per-session map (presence, peer
//! connections, tiles, local tracks) and is driven by a single task consuming
//! one input queue. Server events, backend callbacks, local commands and
//! scheduled retries are all `SessionInput`s, so handlers never interleave.

use crate::error::{ClientError, MediaError, Result};
use crate::media::{
    LocalMedia, MediaDevices, MediaElementFactory, MediaStatusSync, PlaybackUnlockManager,
    UserGesture, VideoDisplayState,
};
use crate::peer::{is_initiator, MediaKind, PeerConnectionManager, PeerEvent, PeerFactory};
use crate::presence::{PresenceBook, StatusOutcome};
use parley_protocol::{
    ClientMessage, IceServer, MediaStatus, ParticipantId, PresenceAction, PresenceRecord,
    ServerMessage, SignalMessage,
};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a notice stays on screen.
pub const NOTICE_DURATION: Duration = Duration::from_secs(5);

/// Everything the session task reacts to
#[derive(Debug)]
pub enum SessionInput {
    Server(ServerMessage),
    Peer {
        peer_id: ParticipantId,
        event: PeerEvent,
    },
    Command(LocalCommand),
    RetryRenegotiation {
        peer_id: ParticipantId,
        reason: String,
        force: bool,
    },
    /// The signaling socket dropped; a fresh `presence:sync` follows once it
    /// is back.
    TransportLost,
}

/// Requests from the user
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCommand {
    SetCamera(bool),
    SetMicrophone(bool),
    HangupAll { reason: Option<String> },
    Gesture(UserGesture),
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A short-lived message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub duration: Duration,
}

impl Notice {
    fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            duration: NOTICE_DURATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Left,
    ForceDisconnect {
        reason: Option<String>,
        initiated_by: Option<ParticipantId>,
    },
    MediaUnavailable(MediaError),
}

/// What a participant tile shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub connected: bool,
    pub video: VideoDisplayState,
}

/// Output for whatever renders the conference
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { self_id: ParticipantId },
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    TileUpdated { id: ParticipantId, tile: Tile },
    LocalMediaChanged(MediaStatus),
    Notice(Notice),
    Ended(EndReason),
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub ice_servers: Vec<IceServer>,
    pub camera_on_join: bool,
}

/// Platform pieces a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
    pub elements: Arc<dyn MediaElementFactory>,
}

pub struct ConferenceSession {
    self_id: Option<ParticipantId>,
    devices: Arc<dyn MediaDevices>,
    local: LocalMedia,
    presence: PresenceBook,
    peers: PeerConnectionManager,
    status_sync: MediaStatusSync,
    playback: PlaybackUnlockManager,
    tiles: HashMap<ParticipantId, Tile>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    input_rx: mpsc::UnboundedReceiver<SessionInput>,
    disposed: bool,
}

impl ConferenceSession {
    /// Acquire local media and set up an idle session.
    ///
    /// Without a microphone there is no session: the failure is reported on
    /// `events` and returned.
    pub async fn create(
        options: SessionOptions,
        deps: SessionDeps,
        signals: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let audio = match deps.devices.acquire(MediaKind::Audio).await {
            Ok(track) => track,
            Err(e) => {
                tracing::error!("Cannot start session without a microphone: {}", e);
                let _ = events.send(SessionEvent::Notice(Notice::new(
                    NoticeLevel::Error,
                    format!("Could not access the microphone: {}", e),
                )));
                let _ = events.send(SessionEvent::Ended(EndReason::MediaUnavailable(e.clone())));
                return Err(ClientError::Media(e));
            }
        };

        let video = if options.camera_on_join {
            match deps.devices.acquire(MediaKind::Video).await {
                Ok(track) => Some(track),
                Err(e) => {
                    tracing::warn!("Joining without camera: {}", e);
                    let _ = events.send(SessionEvent::Notice(Notice::new(
                        NoticeLevel::Warning,
                        format!("Could not start the camera: {}", e),
                    )));
                    None
                }
            }
        } else {
            None
        };

        let (inputs, input_rx) = mpsc::unbounded_channel();
        let playback = PlaybackUnlockManager::new();
        let peers = PeerConnectionManager::new(
            options.ice_servers,
            deps.peers,
            deps.elements,
            playback.clone(),
            signals.clone(),
            inputs.clone(),
        );

        let session = Self {
            self_id: None,
            devices: deps.devices,
            local: LocalMedia {
                audio: Some(audio),
                video,
            },
            presence: PresenceBook::new(),
            peers,
            status_sync: MediaStatusSync::new(),
            playback,
            tiles: HashMap::new(),
            signals,
            events,
            inputs,
            input_rx,
            disposed: false,
        };
        session.emit(SessionEvent::LocalMediaChanged(session.local.status()));

        tracing::info!("Session ready (camera: {})", session.local.video.is_some());
        Ok(session)
    }

    /// Sender for feeding the session: transport, UI, timers.
    pub fn inputs(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.inputs.clone()
    }

    pub fn self_id(&self) -> Option<&ParticipantId> {
        self.self_id.as_ref()
    }

    pub fn local_status(&self) -> MediaStatus {
        self.local.status()
    }

    pub fn tile(&self, id: &ParticipantId) -> Option<Tile> {
        self.tiles.get(id).copied()
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn presence(&self) -> &PresenceBook {
        &self.presence
    }

    /// Process inputs until the session ends.
    pub async fn run(mut self) {
        while let Some(input) = self.input_rx.recv().await {
            if self.handle_input(input).await.is_break() {
                break;
            }
        }
        self.dispose().await;
        tracing::info!("Session finished");
    }

    pub async fn handle_input(&mut self, input: SessionInput) -> ControlFlow<()> {
        if self.disposed {
            tracing::debug!("Session disposed, dropping {:?}", input);
            return ControlFlow::Break(());
        }

        match input {
            SessionInput::Server(message) => return self.on_server_message(message).await,
            SessionInput::Peer { peer_id, event } => {
                self.peers.handle_peer_event(&peer_id, event).await;
                self.refresh_tile(&peer_id);
            }
            SessionInput::Command(command) => return self.on_command(command).await,
            SessionInput::RetryRenegotiation {
                peer_id,
                reason,
                force,
            } => {
                if let Err(e) = self.peers.renegotiate_with_peer(&peer_id, &reason, force).await {
                    tracing::error!("Renegotiation retry with {} failed: {}", peer_id, e);
                }
            }
            SessionInput::TransportLost => {
                tracing::warn!("Signaling connection lost, tearing down peers");
                self.teardown().await;
                self.notice(NoticeLevel::Warning, "Connection lost, reconnecting…");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_server_message(&mut self, message: ServerMessage) -> ControlFlow<()> {
        match message {
            ServerMessage::PresenceSync {
                participants,
                self_id,
            } => self.on_presence_sync(participants, self_id).await,
            ServerMessage::PresenceUpdate {
                action: PresenceAction::Join,
                participant,
                ..
            } => match participant {
                Some(record) => self.on_join(record).await,
                None => tracing::warn!("Join update without a participant"),
            },
            ServerMessage::PresenceUpdate {
                action: PresenceAction::Leave,
                participant,
                participant_id,
            } => match participant_id.or(participant.map(|p| p.id)) {
                Some(id) => self.on_leave(&id).await,
                None => tracing::warn!("Leave update without a participant id"),
            },
            ServerMessage::StatusUpdate { id, media } => {
                match self.presence.apply_status(&id, &media) {
                    StatusOutcome::Created(status) => {
                        tracing::debug!("{} appeared through a status update: {:?}", id, status);
                        self.emit(SessionEvent::ParticipantJoined(id.clone()));
                        self.refresh_tile(&id);
                    }
                    StatusOutcome::Updated(status) => {
                        tracing::debug!("{} media is now {:?}", id, status);
                        self.refresh_tile(&id);
                    }
                    StatusOutcome::Ignored => {}
                }
            }
            ServerMessage::WebrtcSignal {
                from_socket_id,
                signal,
                kind,
                reason,
            } => {
                match SignalMessage::from_wire(kind, signal) {
                    Ok(message) => {
                        self.peers
                            .handle_signal(&from_socket_id, message, reason, &self.local)
                            .await;
                        self.refresh_tile(&from_socket_id);
                    }
                    Err(e) => tracing::warn!("Dropping signal from {}: {}", from_socket_id, e),
                }
            }
            ServerMessage::ForceDisconnect {
                reason,
                initiated_by,
            } => {
                tracing::info!(
                    "Conference ended by {:?} (reason: {:?})",
                    initiated_by,
                    reason
                );
                self.dispose().await;
                self.emit(SessionEvent::Ended(EndReason::ForceDisconnect {
                    reason,
                    initiated_by,
                }));
                return ControlFlow::Break(());
            }
            ServerMessage::Pong => tracing::trace!("Pong"),
            ServerMessage::Error { message } => {
                tracing::warn!("Server error: {}", message);
                self.notice(NoticeLevel::Warning, message);
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_presence_sync(&mut self, participants: Vec<PresenceRecord>, self_id: ParticipantId) {
        if self.self_id.is_some() || !self.peers.is_empty() {
            tracing::debug!("Fresh snapshot, dropping previous presence");
            self.teardown().await;
        }

        tracing::info!(
            "Joined as {} with {} participant(s) in the room",
            self_id,
            participants.len()
        );
        self.self_id = Some(self_id.clone());
        self.peers.set_self_id(Some(self_id.clone()));
        self.emit(SessionEvent::Joined {
            self_id: self_id.clone(),
        });

        let others = self.presence.reset(participants, &self_id);
        for record in others {
            self.emit(SessionEvent::ParticipantJoined(record.id.clone()));
            self.connect(&record.id).await;
        }

        self.broadcast_status(true);
    }

    async fn on_join(&mut self, record: PresenceRecord) {
        if self.self_id.as_ref() == Some(&record.id) {
            return;
        }
        let id = record.id.clone();
        if self.presence.join(record) {
            tracing::info!("{} joined", id);
            self.emit(SessionEvent::ParticipantJoined(id.clone()));
        }
        if self.self_id.is_some() {
            self.connect(&id).await;
        }
    }

    async fn on_leave(&mut self, id: &ParticipantId) {
        let known = self.presence.leave(id).is_some();
        let connected = self.peers.remove_peer(id).await;
        let tiled = self.tiles.remove(id).is_some();

        if known || connected || tiled {
            tracing::info!("{} left", id);
            self.emit(SessionEvent::ParticipantLeft(id.clone()));
        }
    }

    async fn connect(&mut self, remote_id: &ParticipantId) {
        let Some(self_id) = self.self_id.clone() else {
            return;
        };
        let role = is_initiator(&self_id, remote_id);
        if let Err(e) = self.peers.connect_to_peer(remote_id, role, &self.local).await {
            tracing::error!("Failed to connect to {}: {}", remote_id, e);
        }
        self.refresh_tile(remote_id);
    }

    async fn on_command(&mut self, command: LocalCommand) -> ControlFlow<()> {
        match command {
            LocalCommand::SetCamera(on) => self.set_camera(on).await,
            LocalCommand::SetMicrophone(on) => self.set_microphone(on),
            LocalCommand::HangupAll { reason } => {
                tracing::info!("Hanging up everybody ({:?})", reason);
                if self.signals.send(ClientMessage::HangupAll { reason }).is_err() {
                    self.notice(NoticeLevel::Error, "Not connected to the server");
                }
            }
            LocalCommand::Gesture(gesture) => self.playback.notify_gesture(gesture),
            LocalCommand::Leave => {
                tracing::info!("Leaving the conference");
                self.dispose().await;
                self.emit(SessionEvent::Ended(EndReason::Left));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn set_camera(&mut self, on: bool) {
        match (on, self.local.video.is_some()) {
            (true, false) => match self.devices.acquire(MediaKind::Video).await {
                Ok(track) => {
                    tracing::info!("Camera on");
                    self.local.video = Some(track.clone());
                    self.peers.attach_local_video(&track).await;
                }
                Err(e) => {
                    tracing::warn!("Could not start camera: {}", e);
                    self.notice(
                        NoticeLevel::Error,
                        format!("Could not start the camera: {}", e),
                    );
                }
            },
            (false, true) => {
                tracing::info!("Camera off");
                self.peers.detach_local_video().await;
                if let Some(track) = self.local.video.take() {
                    track.stop();
                }
            }
            _ => {}
        }

        self.emit(SessionEvent::LocalMediaChanged(self.local.status()));
        self.broadcast_status(false);
    }

    fn set_microphone(&mut self, on: bool) {
        match &self.local.audio {
            Some(track) => track.set_enabled(on),
            None => {
                self.notice(NoticeLevel::Warning, "No microphone available");
                return;
            }
        }
        self.emit(SessionEvent::LocalMediaChanged(self.local.status()));
        self.broadcast_status(false);
    }

    fn broadcast_status(&mut self, force: bool) {
        let Some(status) = self.status_sync.next_broadcast(self.local.status(), force) else {
            return;
        };
        tracing::debug!("Broadcasting media status {:?}", status);
        if self
            .signals
            .send(ClientMessage::StatusChange {
                media: status.into(),
            })
            .is_err()
        {
            tracing::debug!("Signaling closed, status not sent");
            self.status_sync.reset();
        }
    }

    /// Recompute a participant's tile and report it when it changed.
    fn refresh_tile(&mut self, id: &ParticipantId) {
        let connection = self.peers.get(id);
        if connection.is_none() && !self.presence.contains(id) {
            return;
        }

        let (connected, has_video) = connection
            .map(|c| (c.connected, c.video_enabled))
            .unwrap_or((false, false));
        let tile = Tile {
            connected,
            video: VideoDisplayState::resolve(self.presence.expects_camera(id), has_video),
        };

        if self.tiles.get(id) != Some(&tile) {
            self.tiles.insert(id.clone(), tile);
            self.emit(SessionEvent::TileUpdated {
                id: id.clone(),
                tile,
            });
        }
    }

    /// Forget the room: peers, presence and tiles. Local tracks survive.
    async fn teardown(&mut self) {
        self.peers.close_all().await;
        self.presence.clear();
        for id in self.tiles.drain().map(|(id, _)| id).collect::<Vec<_>>() {
            self.emit(SessionEvent::ParticipantLeft(id));
        }
        self.status_sync.reset();
        self.self_id = None;
        self.peers.set_self_id(None);
    }

    /// Close every peer, stop local tracks and clear presence. Idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.peers.close_all().await;
        self.local.stop_all();
        self.presence.clear();
        self.tiles.clear();
        tracing::debug!("Session disposed");
    }

    fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notice(Notice::new(level, message)));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Nobody is listening for session events");
        }
    }
}

#[cfg(test)]
mod tests;
