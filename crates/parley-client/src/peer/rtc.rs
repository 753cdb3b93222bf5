//! `PeerBackend` on top of webrtc-rs.

use super::backend::{
    ConnectionState, IceConnectionState, MediaKind, PeerBackend, PeerEvent, PeerEventSender,
    PeerFactory, RemoteTrackInfo, SignalingState, TransceiverDirection, TransceiverId,
};
use crate::error::{ClientError, Result};
use crate::media::LocalTrack;
use async_trait::async_trait;
use parley_protocol::{IceCandidate, IceServer, SdpType, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// A remote track that delivers no RTP for this long is reported muted.
const MUTE_AFTER: Duration = Duration::from_secs(2);

pub struct RtcPeerFactory {
    api: Arc<API>,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerBackend>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let wiring = Wiring::open(&self.api, config.clone(), &events).await?;
        Ok(Arc::new(RtcPeer {
            api: self.api.clone(),
            config,
            events,
            wiring: RwLock::new(wiring),
            slots: Mutex::new(Vec::new()),
        }))
    }
}

/// One `RTCPeerConnection` and the switch that silences its callbacks once
/// it has been replaced.
struct Wiring {
    pc: Arc<RTCPeerConnection>,
    retired: Arc<AtomicBool>,
}

impl Wiring {
    async fn open(api: &API, config: RTCConfiguration, events: &PeerEventSender) -> Result<Self> {
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let retired = Arc::new(AtomicBool::new(false));
        register_handlers(&pc, events.clone(), retired.clone());
        Ok(Self { pc, retired })
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: PeerEventSender, retired: Arc<AtomicBool>) {
    let live = move || !retired.load(Ordering::Acquire);

    let tx = events.clone();
    let is_live = live.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let is_live = is_live.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            if !is_live() {
                return;
            }
            match candidate.to_json() {
                Ok(init) => tx.send(PeerEvent::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let tx = events.clone();
    let is_live = live.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let is_live = is_live.clone();
        Box::pin(async move {
            if !is_live() {
                return;
            }
            if let Some(state) = connection_state(state) {
                tx.send(PeerEvent::ConnectionState(state));
            }
        })
    }));

    let tx = events.clone();
    let is_live = live.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        let is_live = is_live.clone();
        Box::pin(async move {
            if !is_live() {
                return;
            }
            if let Some(state) = ice_connection_state(state) {
                tx.send(PeerEvent::IceConnectionState(state));
            }
        })
    }));

    let tx = events.clone();
    let is_live = live.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        let is_live = is_live.clone();
        Box::pin(async move {
            if !is_live() {
                return;
            }
            if let Some(state) = signaling_state(state) {
                tx.send(PeerEvent::SignalingState(state));
            }
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = events.clone();
            let is_live = live.clone();
            Box::pin(async move {
                if is_live() {
                    tokio::spawn(watch_remote_track(track, tx));
                }
            })
        },
    ));
}

/// Drain RTP from a remote track, reporting silence as mute and the end of
/// the stream as ended.
async fn watch_remote_track(track: Arc<TrackRemote>, events: PeerEventSender) {
    let kind = match track.kind() {
        RTPCodecType::Audio => MediaKind::Audio,
        RTPCodecType::Video => MediaKind::Video,
        other => {
            tracing::warn!("Ignoring remote track of kind {:?}", other);
            return;
        }
    };
    let track_id = track.id().to_string();

    events.send(PeerEvent::RemoteTrack(RemoteTrackInfo::new(
        track_id.clone(),
        track.stream_id().to_string(),
        kind,
    )));

    let mut muted = false;
    loop {
        match tokio::time::timeout(MUTE_AFTER, track.read_rtp()).await {
            Ok(Ok(_)) => {
                if muted {
                    muted = false;
                    events.send(PeerEvent::RemoteTrackMuted {
                        track_id: track_id.clone(),
                        muted,
                    });
                }
            }
            Ok(Err(e)) => {
                tracing::debug!("Remote track {} finished: {}", track_id, e);
                break;
            }
            Err(_) => {
                if !muted {
                    muted = true;
                    events.send(PeerEvent::RemoteTrackMuted {
                        track_id: track_id.clone(),
                        muted,
                    });
                }
            }
        }
    }

    events.send(PeerEvent::RemoteTrackEnded { track_id });
}

/// What was asked of a transceiver, so it can be recreated.
struct Slot {
    kind: MediaKind,
    direction: TransceiverDirection,
    track: Option<LocalTrack>,
    transceiver: Arc<RTCRtpTransceiver>,
}

struct RtcPeer {
    api: Arc<API>,
    config: RTCConfiguration,
    events: PeerEventSender,
    wiring: RwLock<Wiring>,
    slots: Mutex<Vec<Slot>>,
}

impl RtcPeer {
    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.wiring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pc
            .clone()
    }

    /// Replace the connection with a fresh one carrying the same transceivers.
    ///
    /// webrtc-rs cannot roll back a local offer, so this is how a pending
    /// offer is abandoned. The old connection's callbacks are silenced
    /// before it is closed; its remote tracks still report their end.
    async fn rebuild(&self) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let fresh = Wiring::open(&self.api, self.config.clone(), &self.events).await?;

        for slot in slots.iter_mut() {
            let init = Some(RTCRtpTransceiverInit {
                direction: rtc_direction(slot.direction),
                send_encodings: vec![],
            });
            let added = match &slot.track {
                Some(track) => {
                    fresh
                        .pc
                        .add_transceiver_from_track(
                            track.rtp() as Arc<dyn TrackLocal + Send + Sync>,
                            init,
                        )
                        .await
                }
                None => {
                    fresh
                        .pc
                        .add_transceiver_from_kind(codec_type(slot.kind), init)
                        .await
                }
            };
            match added {
                Ok(transceiver) => slot.transceiver = transceiver,
                Err(e) => {
                    if let Err(close_err) = fresh.pc.close().await {
                        tracing::warn!("Failed to close half-built connection: {}", close_err);
                    }
                    return Err(e.into());
                }
            }
        }

        let stale = {
            let mut wiring = self.wiring.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *wiring, fresh)
        };
        stale.retired.store(true, Ordering::Release);
        if let Err(e) = stale.pc.close().await {
            tracing::warn!("Failed to close replaced connection: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc().signaling_state()).unwrap_or(SignalingState::Stable)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc().remote_description().await.is_some()
    }

    async fn add_track(
        &self,
        track: &LocalTrack,
        direction: TransceiverDirection,
    ) -> Result<TransceiverId> {
        let mut slots = self.slots.lock().await;
        let transceiver = self
            .pc()
            .add_transceiver_from_track(
                track.rtp() as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: rtc_direction(direction),
                    send_encodings: vec![],
                }),
            )
            .await?;
        slots.push(Slot {
            kind: track.kind(),
            direction,
            track: Some(track.clone()),
            transceiver,
        });
        Ok(TransceiverId(slots.len() - 1))
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<TransceiverId> {
        let mut slots = self.slots.lock().await;
        let transceiver = self
            .pc()
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: rtc_direction(direction),
                    send_encodings: vec![],
                }),
            )
            .await?;
        slots.push(Slot {
            kind,
            direction,
            track: None,
            transceiver,
        });
        Ok(TransceiverId(slots.len() - 1))
    }

    async fn replace_track(
        &self,
        transceiver: TransceiverId,
        track: Option<&LocalTrack>,
    ) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(transceiver.0)
            .ok_or_else(|| unknown_transceiver(transceiver))?;
        slot.transceiver
            .sender()
            .await
            .replace_track(track.map(|t| t.rtp() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        slot.track = track.cloned();
        Ok(())
    }

    async fn set_direction(
        &self,
        transceiver: TransceiverId,
        direction: TransceiverDirection,
    ) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(transceiver.0)
            .ok_or_else(|| unknown_transceiver(transceiver))?;
        slot.transceiver.set_direction(rtc_direction(direction)).await;
        slot.direction = direction;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc().create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc().create_answer(None).await?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc().set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc().set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let state = self.pc().signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(ClientError::Negotiation(format!(
                "nothing to roll back in state {}",
                state
            )));
        }
        self.rebuild().await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc()
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc().close().await?;
        Ok(())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        // There is no public constructor for rollback descriptions.
        SdpType::Rollback => serde_json::from_value(serde_json::json!({
            "type": "rollback",
            "sdp": description.sdp,
        }))
        .map_err(|e| ClientError::Negotiation(format!("invalid rollback description: {}", e)))?,
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(ClientError::Negotiation(
                "description without a type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn unknown_transceiver(id: TransceiverId) -> ClientError {
    ClientError::Negotiation(format!("unknown transceiver {}", id.0))
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn rtc_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::Sendrecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::Sendonly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::Recvonly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        RTCSignalingState::Unspecified => None,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}
