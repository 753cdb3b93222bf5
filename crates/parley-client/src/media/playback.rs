//! Autoplay unlocking
//!
//! Playback of a remote stream can be refused until the user has interacted
//! with the client. Refused elements are parked until the first user gesture,
//! then every parked element is retried in one go.

use crate::peer::RemoteTrackInfo;
use async_trait::async_trait;
use parley_protocol::ParticipantId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

const UNMUTE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserGesture {
    PointerDown,
    TouchStart,
    KeyDown,
    Focus,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Playback refused: {0}")]
pub struct PlaybackBlocked(pub String);

/// Sink that renders one remote participant's media.
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn attach(&self, track: &RemoteTrackInfo);

    fn detach(&self, track_id: &str);

    async fn play(&self) -> Result<(), PlaybackBlocked>;

    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;
}

pub trait MediaElementFactory: Send + Sync {
    fn create(&self, peer: &ParticipantId) -> Arc<dyn MediaElement>;
}

/// Element for runs without any output device; playback always succeeds.
pub struct HeadlessElement {
    label: String,
    muted: AtomicBool,
    tracks: StdMutex<HashSet<String>>,
}

impl HeadlessElement {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            muted: AtomicBool::new(false),
            tracks: StdMutex::new(HashSet::new()),
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().map(|t| t.len()).unwrap_or_default()
    }
}

#[async_trait]
impl MediaElement for HeadlessElement {
    fn attach(&self, track: &RemoteTrackInfo) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.insert(track.track_id.clone());
        }
        tracing::debug!("{}: attached {:?} track {}", self.label, track.kind, track.track_id);
    }

    fn detach(&self, track_id: &str) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.remove(track_id);
        }
    }

    async fn play(&self) -> Result<(), PlaybackBlocked> {
        Ok(())
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

pub struct HeadlessElements;

impl MediaElementFactory for HeadlessElements {
    fn create(&self, peer: &ParticipantId) -> Arc<dyn MediaElement> {
        Arc::new(HeadlessElement::new(format!("remote-{}", peer)))
    }
}

struct Parked {
    label: String,
    element: Arc<dyn MediaElement>,
    keep_muted: bool,
}

#[derive(Default)]
struct UnlockState {
    parked: Vec<Parked>,
    listening: bool,
}

#[derive(Clone)]
pub struct PlaybackUnlockManager {
    state: Arc<Mutex<UnlockState>>,
    gestures: broadcast::Sender<UserGesture>,
}

impl PlaybackUnlockManager {
    pub fn new() -> Self {
        let (gestures, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(UnlockState::default())),
            gestures,
        }
    }

    /// Report a user interaction.
    pub fn notify_gesture(&self, gesture: UserGesture) {
        // Nobody listening means nothing is parked.
        let _ = self.gestures.send(gesture);
    }

    /// Start playback muted, then unmute shortly after unless `keep_muted`.
    ///
    /// Returns false when playback was refused and the element got parked.
    pub async fn force_play(
        &self,
        element: Arc<dyn MediaElement>,
        label: &str,
        keep_muted: bool,
    ) -> bool {
        element.set_muted(true);

        match element.play().await {
            Ok(()) => {
                if !keep_muted {
                    tokio::spawn(async move {
                        tokio::time::sleep(UNMUTE_DELAY).await;
                        element.set_muted(false);
                    });
                }
                true
            }
            Err(e) => {
                tracing::warn!("{} cannot play yet ({}), waiting for a user gesture", label, e);
                self.park(Parked {
                    label: label.to_string(),
                    element,
                    keep_muted,
                })
                .await;
                false
            }
        }
    }

    /// Drop a parked element, e.g. because its peer left.
    pub async fn cancel(&self, element: &Arc<dyn MediaElement>) {
        let mut state = self.state.lock().await;
        state.parked.retain(|p| !Arc::ptr_eq(&p.element, element));
    }

    pub async fn parked_count(&self) -> usize {
        self.state.lock().await.parked.len()
    }

    pub async fn is_listening(&self) -> bool {
        self.state.lock().await.listening
    }

    async fn park(&self, parked: Parked) {
        let mut state = self.state.lock().await;
        if !state
            .parked
            .iter()
            .any(|p| Arc::ptr_eq(&p.element, &parked.element))
        {
            state.parked.push(parked);
        }
        if !state.listening {
            state.listening = true;
            self.listen();
        }
    }

    fn listen(&self) {
        let mut gestures = self.gestures.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            match gestures.recv().await {
                Ok(gesture) => tracing::debug!("{:?} unlocks playback", gesture),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
            drop(gestures);
            manager.retry_parked().await;
        });
    }

    async fn retry_parked(&self) {
        let parked = {
            let mut state = self.state.lock().await;
            state.listening = false;
            std::mem::take(&mut state.parked)
        };

        tracing::info!("Retrying playback of {} element(s)", parked.len());
        for p in parked {
            self.force_play(p.element, &p.label, p.keep_muted).await;
        }
    }
}

impl Default for PlaybackUnlockManager {
    fn default() -> Self {
        Self::new()
    }
}
