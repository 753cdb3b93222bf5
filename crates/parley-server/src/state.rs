use crate::presence::PresenceRegistry;
use crate::relay::SignalRelay;
use crate::ws::connections::ConnectionManager;
use parley_protocol::IceServer;
use std::sync::Arc;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]);

        let turn_servers = match std::env::var("TURN_URL") {
            Ok(url) => {
                let username = std::env::var("TURN_USERNAME")
                    .map_err(|_| anyhow::anyhow!("TURN_URL is set but TURN_USERNAME is not"))?;
                let credential = std::env::var("TURN_CREDENTIAL")
                    .map_err(|_| anyhow::anyhow!("TURN_URL is set but TURN_CREDENTIAL is not"))?;
                vec![TurnServer {
                    url,
                    username,
                    credential,
                }]
            }
            Err(_) => vec![],
        };

        Ok(Config {
            bind_address,
            stun_servers,
            turn_servers,
        })
    }

    /// STUN entries first, then TURN entries with their credentials.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self.stun_servers.iter().map(|url| IceServer {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        });
        let turn = self.turn_servers.iter().map(|turn| IceServer {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });
        stun.chain(turn).collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub presence: Arc<PresenceRegistry>,
    pub relay: SignalRelay,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let presence = Arc::new(PresenceRegistry::new(connections.clone()));
        let relay = SignalRelay::new(connections.clone());

        Self {
            config,
            connections,
            presence,
            relay,
        }
    }
}
