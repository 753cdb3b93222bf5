//! Wire protocol shared by the Parley signaling server and clients.
//!
//! Every frame on the signaling socket is a JSON object of the form
//! `{"event": "<name>", "data": <payload>}`.

mod messages;
mod signal;
mod types;

pub use messages::{ClientMessage, PresenceAction, ServerMessage};
pub use signal::{ProtocolError, SignalKind, SignalMessage};
pub use types::{
    IceCandidate, IceServer, MediaPatch, MediaStatus, ParticipantId, PresenceRecord, SdpType,
    SessionDescription,
};

/// Room joined when the client does not name one.
pub const DEFAULT_ROOM: &str = "main";
