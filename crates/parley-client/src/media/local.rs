use crate::error::MediaError;
use crate::peer::MediaKind;
use async_trait::async_trait;
use parley_protocol::MediaStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

static NEXT_TRACK: AtomicU64 = AtomicU64::new(1);

/// One 20 ms Opus frame of silence
const SILENT_OPUS: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// 16x16 VP8 key frame header with an empty first partition
const BLACK_VP8: [u8; 20] = [
    0x50, 0x01, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];
const VIDEO_FRAME: Duration = Duration::from_millis(100);

/// A captured local track, shared read-only by every peer connection.
///
/// Clones share the enabled/stopped flags. Only the session toggles them.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!(
            "{}-{}",
            match kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            },
            NEXT_TRACK.fetch_add(1, Ordering::Relaxed)
        );

        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            id,
            kind,
            rtp,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        self.rtp.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed) {
            tracing::debug!("Stopped local {:?} track {}", self.kind, self.id);
        }
    }

    /// Write silent audio or black video until the track is stopped.
    ///
    /// Nothing is written while the track is disabled, so the far end sees
    /// the track go quiet.
    pub fn spawn_synthetic_feed(&self) -> JoinHandle<()> {
        let track = self.clone();
        tokio::spawn(track.feed_synthetic())
    }

    async fn feed_synthetic(self) {
        let (payload, duration): (&[u8], Duration) = match self.kind {
            MediaKind::Audio => (&SILENT_OPUS[..], AUDIO_FRAME),
            MediaKind::Video => (&BLACK_VP8[..], VIDEO_FRAME),
        };
        let sample = Sample {
            data: payload.to_vec().into(),
            duration,
            ..Default::default()
        };

        let mut ticker = tokio::time::interval(duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.is_live() {
                break;
            }
            if !self.is_enabled() {
                continue;
            }
            // Fails while a binding is being torn down; the next tick retries.
            if let Err(e) = self.rtp.write_sample(&sample).await {
                tracing::trace!("Sample for {} not written: {}", self.id, e);
            }
        }
        tracing::debug!("Synthetic feed for {} finished", self.id);
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// The local microphone and camera, when acquired
#[derive(Debug, Default)]
pub struct LocalMedia {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalMedia {
    /// What peers should be told about our devices.
    pub fn status(&self) -> MediaStatus {
        let active = |track: &Option<LocalTrack>| {
            track
                .as_ref()
                .is_some_and(|t| t.is_live() && t.is_enabled())
        };
        MediaStatus::new(active(&self.video), active(&self.audio))
    }

    pub fn stop_all(&mut self) {
        for track in [self.audio.take(), self.video.take()].into_iter().flatten() {
            track.stop();
        }
    }
}

/// Source of capture tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MediaError>;
}

/// Devices backed by silent/black synthetic tracks, for headless runs.
pub struct SyntheticDevices {
    camera_available: bool,
    microphone_available: bool,
    stream_id: String,
}

impl SyntheticDevices {
    pub fn new(camera_available: bool, microphone_available: bool) -> Self {
        Self {
            camera_available,
            microphone_available,
            stream_id: format!("parley-{}", NEXT_TRACK.fetch_add(1, Ordering::Relaxed)),
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MediaError> {
        let available = match kind {
            MediaKind::Audio => self.microphone_available,
            MediaKind::Video => self.camera_available,
        };
        if !available {
            return Err(MediaError::NotFound(kind));
        }
        let track = LocalTrack::new(kind, &self.stream_id);
        track.spawn_synthetic_feed();
        Ok(track)
    }
}
