// src/transport/http.rs
//! Point-to-point HTTP polling against the controller's embedded web server

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;

use crate::device::{DeviceCommand, DeviceEndpoint, DeviceStatus};
use crate::error::{Result, SyncError};
use crate::transport::DeviceTransport;
use crate::log_debug;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: &DeviceEndpoint, timeout: Duration) -> Result<Self> {
        let base_url = endpoint
            .http_base_url()
            .ok_or_else(|| SyncError::InvalidEndpoint(endpoint.to_string()))?;
        Self::with_base_url(base_url, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // LAN devices are never reached through a proxy
        let client = Client::builder().timeout(timeout).no_proxy().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| self.map_error(e))?;
        if response.status() != StatusCode::OK {
            return Err(SyncError::DeviceRejected(response.status().as_u16()));
        }
        Ok(response)
    }

    fn map_error(&self, error: reqwest::Error) -> SyncError {
        if error.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_status(&self) -> Result<DeviceStatus> {
        let response = self.execute(self.client.get(self.url("/status"))).await?;
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        log_debug!("GET {}/status -> {}", self.base_url, String::from_utf8_lossy(&body));
        Ok(DeviceStatus::from_json(&body)?)
    }

    async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        let request = match command {
            DeviceCommand::StartPump => self.client.post(self.url("/pump/start")),
            DeviceCommand::StopPump => self.client.post(self.url("/pump/stop")),
            DeviceCommand::SetMode(mode) => self
                .client
                .post(self.url("/mode"))
                .json(&serde_json::json!({ "mode": mode })),
        };
        self.execute(request).await?;
        log_debug!("{} acknowledged by {}", command, self.base_url);
        Ok(())
    }
}
