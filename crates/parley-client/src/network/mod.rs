//! Signaling transport and HTTP helpers

mod api;
mod websocket;

pub use api::{fetch_ice_servers, CallDirectory, PendingCall};

use crate::session::SessionInput;
use parley_protocol::ClientMessage;
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use websocket::PumpExit;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const JITTER: f64 = 0.2;

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_BACKOFF, MAX_BACKOFF)
    }

    pub fn with_limits(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one WebSocket to the signaling server alive for a session.
pub struct SignalingClient {
    url: String,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Start the connection task. Server events go to `inputs`; `outbound`
    /// is written to the socket while it is up.
    pub fn spawn(
        self,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        inputs: mpsc::UnboundedSender<SessionInput>,
    ) -> SignalingHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(outbound, inputs, shutdown_rx));
        SignalingHandle { shutdown, task }
    }

    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
        inputs: mpsc::UnboundedSender<SessionInput>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new();
        let mut reconnecting = false;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match websocket::connect(&self.url).await {
                Ok(stream) => {
                    tracing::info!("Connected to signaling server at {}", self.url);
                    backoff.reset();
                    if reconnecting {
                        let stale = discard_queued(&mut outbound);
                        if stale > 0 {
                            tracing::debug!("Discarded {} message(s) queued while offline", stale);
                        }
                    }

                    match websocket::pump(stream, &mut outbound, &inputs, &mut shutdown).await {
                        PumpExit::Shutdown | PumpExit::SessionGone => return,
                        PumpExit::Dropped => {
                            tracing::warn!("Signaling connection dropped");
                            if inputs.send(SessionInput::TransportLost).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!("Could not reach {}: {}", self.url, e),
            }
            reconnecting = true;

            let delay = backoff.next_delay();
            tracing::debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

fn discard_queued(outbound: &mut mpsc::UnboundedReceiver<ClientMessage>) -> usize {
    let mut count = 0;
    while outbound.try_recv().is_ok() {
        count += 1;
    }
    count
}

pub struct SignalingHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SignalingHandle {
    /// Close the socket and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Signaling task failed: {}", e);
        }
    }
}
