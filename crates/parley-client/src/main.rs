use anyhow::{Context, Result};
use parley_client::media::{HeadlessElements, SyntheticDevices};
use parley_client::network::{fetch_ice_servers, CallDirectory, SignalingClient};
use parley_client::peer::rtc::RtcPeerFactory;
use parley_client::session::{NoticeLevel, SessionOptions};
use parley_client::{
    ClientConfig, ConferenceSession, LocalCommand, SessionDeps, SessionEvent, SessionInput,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    tracing::info!("Starting Parley client for {}", config.server_url);

    if let Some(room) = answer_pending_call(&config).await {
        config.room = room;
    }

    let ice_servers = if config.ice_servers.is_empty() {
        fetch_ice_servers(&config.server_url)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Could not fetch ICE servers, using host candidates only: {}", e);
                Vec::new()
            })
    } else {
        config.ice_servers.clone()
    };

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let deps = SessionDeps {
        devices: Arc::new(SyntheticDevices::new(
            config.camera_available,
            config.microphone_available,
        )),
        peers: Arc::new(RtcPeerFactory::new()?),
        elements: Arc::new(HeadlessElements),
    };
    let options = SessionOptions {
        ice_servers,
        camera_on_join: config.camera_on_join,
    };
    let session = ConferenceSession::create(options, deps, signal_tx, event_tx)
        .await
        .context("Failed to start the session")?;

    tracing::info!("Joining room {}", config.room);
    let inputs = session.inputs();
    let signaling = SignalingClient::new(config.ws_url()).spawn(signal_rx, inputs.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, leaving");
            let _ = inputs.send(SessionInput::Command(LocalCommand::Leave));
        }
    });

    session.run().await;
    signaling.shutdown().await;
    let _ = printer.await;

    Ok(())
}

/// Check the call directory for a call waiting for us; returns its room.
async fn answer_pending_call(config: &ClientConfig) -> Option<String> {
    let (Some(directory_url), Some(subscriber_id)) = (&config.directory_url, &config.subscriber_id)
    else {
        return None;
    };
    let directory = CallDirectory::new(directory_url.as_str());

    let call = match directory.pending_call(subscriber_id).await {
        Ok(Some(call)) => call,
        Ok(None) => {
            tracing::debug!("No pending call for {}", subscriber_id);
            return None;
        }
        Err(e) => {
            tracing::warn!("Call directory unavailable: {}", e);
            return None;
        }
    };

    tracing::info!("Answering call {} from {:?}", call.id, call.caller_name);
    if let Err(e) = directory.acknowledge(&call.id).await {
        tracing::warn!("Failed to acknowledge call {}: {}", call.id, e);
    }
    call.room
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Notice(notice) => match notice.level {
            NoticeLevel::Error => tracing::error!("{}", notice.message),
            NoticeLevel::Warning => tracing::warn!("{}", notice.message),
            NoticeLevel::Info => tracing::info!("{}", notice.message),
        },
        SessionEvent::Ended(reason) => tracing::info!("Session ended: {:?}", reason),
        other => tracing::debug!("{:?}", other),
    }
}
