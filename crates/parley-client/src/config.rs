use crate::error::Result;
use config::{Config, Environment, File};
use parley_protocol::{IceServer, DEFAULT_ROOM};
use serde::Deserialize;

/// Client settings, from an optional `parley.toml` then `PARLEY_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_room")]
    pub room: String,
    #[serde(default)]
    pub camera_on_join: bool,
    #[serde(default = "enabled")]
    pub camera_available: bool,
    #[serde(default = "enabled")]
    pub microphone_available: bool,
    /// Empty means: ask the signaling server
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default)]
    pub subscriber_id: Option<String>,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

fn enabled() -> bool {
    true
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("parley").required(false))
            .add_source(Environment::with_prefix("PARLEY").try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// WebSocket endpoint for the configured room.
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws?room={}", base, urlencoding::encode(&self.room))
    }
}
