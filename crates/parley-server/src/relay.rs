use crate::ws::connections::ConnectionManager;
use parley_protocol::{ParticipantId, ServerMessage, SignalKind};
use std::sync::Arc;

/// Best-effort forwarder for `webrtc-signal` payloads.
///
/// The payload is never inspected. A message for a target that is no longer
/// connected is dropped without telling the sender; peers supersede stale
/// signals with fresh offers anyway.
#[derive(Clone)]
pub struct SignalRelay {
    connections: Arc<ConnectionManager>,
}

impl SignalRelay {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Returns whether the message was handed to the target's transport.
    pub async fn relay(
        &self,
        from: &ParticipantId,
        target: &ParticipantId,
        signal: serde_json::Value,
        kind: SignalKind,
        reason: Option<String>,
    ) -> bool {
        if from == target {
            tracing::warn!("Participant {} tried to signal itself", from);
            return false;
        }

        let delivered = self
            .connections
            .send_to_connection(
                target,
                &ServerMessage::WebrtcSignal {
                    from_socket_id: from.clone(),
                    signal,
                    kind,
                    reason,
                },
            )
            .await;

        if delivered {
            tracing::debug!("Relayed {:?} from {} to {}", kind, from, target);
        } else {
            tracing::debug!("Dropped {:?} from {}: {} is gone", kind, from, target);
        }

        delivered
    }
}
