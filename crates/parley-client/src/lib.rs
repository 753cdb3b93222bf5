//! Parley client library
//!
//! Joins a conference room over the signaling socket and keeps one WebRTC
//! connection per remote participant: presence tracking, initiator election,
//! offer/answer with glare handling, renegotiation, media status and
//! playback unlocking.

pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod peer;
pub mod presence;
pub mod session;

pub use config::ClientConfig;
pub use error::{ClientError, MediaError, Result};
pub use session::{ConferenceSession, LocalCommand, SessionDeps, SessionEvent, SessionInput};
