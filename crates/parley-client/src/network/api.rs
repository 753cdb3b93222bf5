use crate::error::{ClientError, Result};
use chrono::{DateTime, Utc};
use parley_protocol::IceServer;
use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};

async fn check(response: Response) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }
    Ok(response)
}

async fn get<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T> {
    let response = check(client.get(url).send().await?).await?;
    Ok(response.json().await?)
}

async fn post_empty(client: &reqwest::Client, url: &str) -> Result<()> {
    check(client.post(url).send().await?).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct IceServersResponse {
    ice_servers: Vec<IceServer>,
}

/// STUN/TURN list published by the signaling server.
pub async fn fetch_ice_servers(server_url: &str) -> Result<Vec<IceServer>> {
    let url = format!("{}/api/rtc/ice-servers", server_url.trim_end_matches('/'));
    let response: IceServersResponse = get(&reqwest::Client::new(), &url).await?;
    Ok(response.ice_servers)
}

/// A call waiting for a subscriber
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    pub id: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Client for the external call directory
#[derive(Clone)]
pub struct CallDirectory {
    http: reqwest::Client,
    base_url: String,
}

impl CallDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The call waiting for `subscriber_id`, if any.
    pub async fn pending_call(&self, subscriber_id: &str) -> Result<Option<PendingCall>> {
        let url = format!(
            "{}/api/calls/pending/{}",
            self.base_url,
            urlencoding::encode(subscriber_id)
        );
        match get::<Option<PendingCall>>(&self.http, &url).await {
            Err(ClientError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }) => Ok(None),
            other => other,
        }
    }

    pub async fn acknowledge(&self, call_id: &str) -> Result<()> {
        let url = format!(
            "{}/api/calls/{}/ack",
            self.base_url,
            urlencoding::encode(call_id)
        );
        post_empty(&self.http, &url).await
    }
}
