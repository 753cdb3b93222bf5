mod local;
pub mod playback;
pub mod status;

pub use local::{LocalMedia, LocalTrack, MediaDevices, SyntheticDevices};
pub use playback::{
    HeadlessElement, HeadlessElements, MediaElement, MediaElementFactory, PlaybackBlocked,
    PlaybackUnlockManager, UserGesture,
};
pub use status::{MediaStatusSync, VideoDisplayState};
