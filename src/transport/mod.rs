// src/transport/mod.rs
//! Device transports. The sync client only ever talks to `DeviceTransport`;
//! which wire protocol sits behind it is decided per endpoint by a factory.

pub mod http;
pub mod mqtt;
pub mod simulated;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::device::{DeviceCommand, DeviceEndpoint, DeviceStatus};
use crate::error::Result;

pub use http::HttpTransport;
pub use mqtt::MqttTransport;
pub use simulated::{SimulatedFactory, SimulatedTransport};

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Upper bound the client puts around every call on this transport.
    fn timeout(&self) -> Duration;

    /// One status read. Implementations must not return partially decoded
    /// state; any decode problem is an error.
    async fn fetch_status(&self) -> Result<DeviceStatus>;

    /// Resolves once the device (or broker) acknowledged the command.
    async fn send_command(&self, command: DeviceCommand) -> Result<()>;

    /// Release sockets and background tasks.
    async fn close(&self) {}
}

pub trait TransportFactory: Send + Sync {
    fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Arc<dyn DeviceTransport>>;
}

/// HTTP for LAN addresses, MQTT for broker URIs.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    config: SyncConfig,
}

impl DefaultTransportFactory {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Arc<dyn DeviceTransport>> {
        match endpoint {
            DeviceEndpoint::Http { .. } => {
                let transport = HttpTransport::new(endpoint, self.config.http_timeout())?;
                Ok(Arc::new(transport))
            }
            DeviceEndpoint::Broker { .. } => {
                let transport = MqttTransport::connect(
                    endpoint,
                    &self.config.mqtt,
                    self.config.long_poll_timeout(),
                )?;
                Ok(Arc::new(transport))
            }
        }
    }
}
