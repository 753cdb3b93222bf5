use parley_protocol::MediaStatus;

/// Deduplicates outgoing `status:change` broadcasts.
#[derive(Debug, Default)]
pub struct MediaStatusSync {
    last_sent: Option<MediaStatus>,
}

impl MediaStatusSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the status to send, or `None` when peers already have it.
    pub fn next_broadcast(&mut self, current: MediaStatus, force: bool) -> Option<MediaStatus> {
        if !force && self.last_sent == Some(current) {
            return None;
        }
        self.last_sent = Some(current);
        Some(current)
    }

    pub fn last_sent(&self) -> Option<MediaStatus> {
        self.last_sent
    }

    /// Forget what was sent; used when the transport is lost.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

/// How a remote participant's video tile should be drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoDisplayState {
    /// Camera reported on and video is arriving
    Live,
    /// Camera reported on, no video yet
    Waiting,
    /// Camera reported off but video is arriving anyway
    Mismatch,
    Off,
}

impl VideoDisplayState {
    pub fn resolve(expected_cam: bool, has_video: bool) -> Self {
        match (expected_cam, has_video) {
            (true, true) => VideoDisplayState::Live,
            (true, false) => VideoDisplayState::Waiting,
            (false, true) => VideoDisplayState::Mismatch,
            (false, false) => VideoDisplayState::Off,
        }
    }

    pub fn shows_video(self) -> bool {
        matches!(self, VideoDisplayState::Live | VideoDisplayState::Mismatch)
    }
}
