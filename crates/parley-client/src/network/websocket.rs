use crate::error::Result;
use crate::session::SessionInput;
use futures_util::{Sink, SinkExt, StreamExt};
use parley_protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const PING_INTERVAL: Duration = Duration::from_secs(25);

pub(crate) type SignalingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection stopped being pumped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// Socket closed or failed; reconnect
    Dropped,
    /// Asked to stop
    Shutdown,
    /// Nobody consumes our events or produces outbound ones anymore
    SessionGone,
}

pub(crate) async fn connect(url: &str) -> Result<SignalingStream> {
    let (stream, _) = connect_async(url).await?;
    Ok(stream)
}

/// Shuttle frames between one socket and the session until either side ends.
pub(crate) async fn pump(
    stream: SignalingStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    inputs: &mpsc::UnboundedSender<SessionInput>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    let (mut write, mut read) = stream.split();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            tracing::debug!("<- {:?}", message);
                            if inputs.send(SessionInput::Server(message)).is_err() {
                                return PumpExit::SessionGone;
                            }
                        }
                        Err(e) => tracing::warn!("Unparseable server frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Server closed the signaling socket: {:?}", frame);
                    return PumpExit::Dropped;
                }
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Signaling socket error: {}", e);
                    return PumpExit::Dropped;
                }
                None => return PumpExit::Dropped,
            },
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::SessionGone;
                };
                if let Err(e) = send(&mut write, &message).await {
                    tracing::warn!("Failed to send {:?}: {}", message, e);
                    return PumpExit::Dropped;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = send(&mut write, &ClientMessage::Ping).await {
                    tracing::warn!("Keepalive failed: {}", e);
                    return PumpExit::Dropped;
                }
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }
        }
    }
}

async fn send<S>(write: &mut S, message: &ClientMessage) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message).map_err(parley_protocol::ProtocolError::from)?;
    tracing::trace!("-> {}", json);
    write.send(Message::Text(json.into())).await?;
    Ok(())
}
