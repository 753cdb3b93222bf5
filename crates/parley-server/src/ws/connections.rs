use parley_protocol::{ParticipantId, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Live transports, keyed by participant id.
///
/// Every send is a non-blocking push onto the connection's outbound queue, so
/// callers may hold other locks while sending.
pub struct ConnectionManager {
    /// Map from participant ID to message sender channel
    senders: RwLock<HashMap<ParticipantId, mpsc::UnboundedSender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: ParticipantId,
        sender: mpsc::UnboundedSender<String>,
    ) {
        tracing::debug!("Connection {} registered", connection_id);
        self.senders.write().await.insert(connection_id, sender);
    }

    pub async fn remove_connection(&self, connection_id: &ParticipantId) {
        if self.senders.write().await.remove(connection_id).is_some() {
            tracing::debug!("Connection {} removed", connection_id);
        }
    }

    /// Returns false when the connection is unknown or its socket is gone.
    pub async fn send_to_connection(
        &self,
        connection_id: &ParticipantId,
        message: &ServerMessage,
    ) -> bool {
        let Some(json) = encode(message) else {
            return false;
        };

        let senders = self.senders.read().await;

        match senders.get(connection_id) {
            Some(sender) => match sender.send(json) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Failed to send message to {}: {}", connection_id, e);
                    false
                }
            },
            None => false,
        }
    }

    pub async fn send_to_many<'a, I>(&self, connection_ids: I, message: &ServerMessage)
    where
        I: IntoIterator<Item = &'a ParticipantId>,
    {
        let Some(json) = encode(message) else {
            return;
        };

        let senders = self.senders.read().await;

        for conn_id in connection_ids {
            if let Some(sender) = senders.get(conn_id) {
                if let Err(e) = sender.send(json.clone()) {
                    tracing::error!("Failed to send message to {}: {}", conn_id, e);
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(j) => Some(j),
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            None
        }
    }
}
