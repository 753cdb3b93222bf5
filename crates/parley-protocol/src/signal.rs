use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{IceCandidate, SdpType, SessionDescription};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed {kind:?} payload: {source}")]
    MalformedSignal {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Expected {expected:?} description, got {found:?}")]
    UnexpectedSdpType { expected: SdpType, found: SdpType },

    #[error("Failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The `type` tag of a `webrtc-signal` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    RenegotiateRequest,
}

/// Typed view of a signaling payload.
///
/// The server relays the untyped `signal` value as-is; only peers decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    RenegotiateRequest,
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::Offer(_) => SignalKind::Offer,
            SignalMessage::Answer(_) => SignalKind::Answer,
            SignalMessage::IceCandidate(_) => SignalKind::IceCandidate,
            SignalMessage::RenegotiateRequest => SignalKind::RenegotiateRequest,
        }
    }

    pub fn to_wire(&self) -> Result<serde_json::Value, ProtocolError> {
        let value = match self {
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => serde_json::to_value(desc)?,
            SignalMessage::IceCandidate(candidate) => serde_json::to_value(candidate)?,
            SignalMessage::RenegotiateRequest => serde_json::Value::Object(Default::default()),
        };
        Ok(value)
    }

    pub fn from_wire(kind: SignalKind, signal: serde_json::Value) -> Result<Self, ProtocolError> {
        let malformed = |source| ProtocolError::MalformedSignal { kind, source };
        match kind {
            SignalKind::Offer => {
                let desc: SessionDescription = serde_json::from_value(signal).map_err(malformed)?;
                expect_sdp_type(&desc, SdpType::Offer)?;
                Ok(SignalMessage::Offer(desc))
            }
            SignalKind::Answer => {
                let desc: SessionDescription = serde_json::from_value(signal).map_err(malformed)?;
                expect_sdp_type(&desc, SdpType::Answer)?;
                Ok(SignalMessage::Answer(desc))
            }
            SignalKind::IceCandidate => {
                let candidate = serde_json::from_value(signal).map_err(malformed)?;
                Ok(SignalMessage::IceCandidate(candidate))
            }
            SignalKind::RenegotiateRequest => Ok(SignalMessage::RenegotiateRequest),
        }
    }
}

fn expect_sdp_type(desc: &SessionDescription, expected: SdpType) -> Result<(), ProtocolError> {
    if desc.sdp_type == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedSdpType {
            expected,
            found: desc.sdp_type,
        })
    }
}
