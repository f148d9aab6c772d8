//! Outbound mobile push.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushError(pub String);

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "push error: {}", self.0)
    }
}

impl std::error::Error for PushError {}

impl From<reqwest::Error> for PushError {
    fn from(e: reqwest::Error) -> Self {
        PushError(e.to_string())
    }
}

/// Fire-and-forget delivery to one device. No retries.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn notify(&self, device: &str, message: &PushMessage) -> Result<(), PushError>;
}

#[derive(Serialize)]
struct WireMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a serde_json::Value,
}

/// JSON `{to, title, body, data}` POSTed to a third-party push service.
pub struct HttpPushGateway {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpPushGateway {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, PushError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn notify(&self, device: &str, message: &PushMessage) -> Result<(), PushError> {
        let wire = WireMessage {
            to: device,
            title: &message.title,
            body: &message.body,
            data: &message.data,
        };
        let mut request = self.client.post(&self.url).json(&wire);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!("push to {device}: {}", message.title);
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("push gateway returned {status}: {body}");
            return Err(PushError(format!("gateway returned {status}")));
        }
        Ok(())
    }
}

/// Used when no push service is configured.
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn notify(&self, device: &str, message: &PushMessage) -> Result<(), PushError> {
        info!(device, title = %message.title, "push (not delivered): {}", message.body);
        Ok(())
    }
}

/// Keeps every message in memory; handy for wiring checks.
#[derive(Default)]
pub struct MemoryPushGateway {
    sent: tokio::sync::Mutex<Vec<(String, PushMessage)>>,
}

impl MemoryPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, PushMessage)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PushGateway for MemoryPushGateway {
    async fn notify(&self, device: &str, message: &PushMessage) -> Result<(), PushError> {
        self.sent.lock().await.push((device.to_string(), message.clone()));
        Ok(())
    }
}
