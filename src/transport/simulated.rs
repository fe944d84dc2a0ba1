// src/transport/simulated.rs
//! In-process stand-in for a controller. Used by the runner's `--simulate`
//! mode and by tests that need to script failures and count network calls.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::{DeviceCommand, DeviceEndpoint, DeviceMode, DeviceStatus};
use crate::error::{Result, SyncError};
use crate::transport::{DeviceTransport, TransportFactory};

#[derive(Debug)]
struct DeviceState {
    status: DeviceStatus,
    fail_reads: bool,
    reject_commands: Option<u16>,
    latency: Duration,
    reads: usize,
    commands: Vec<DeviceCommand>,
}

#[derive(Debug)]
pub struct SimulatedTransport {
    state: Mutex<DeviceState>,
    timeout: Duration,
}

impl SimulatedTransport {
    pub fn new(status: DeviceStatus) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                status,
                fail_reads: false,
                reject_commands: None,
                latency: Duration::ZERO,
                reads: 0,
                commands: Vec::new(),
            }),
            timeout: Duration::from_secs(5),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.with_state(|s| s.status = status);
    }

    pub fn set_moisture(&self, level: i64) {
        self.with_state(|s| s.status.moisture_level = level);
    }

    /// While set, every status read fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.fail_reads = offline);
    }

    /// While set, commands are answered with this HTTP-style status code.
    pub fn reject_commands(&self, code: Option<u16>) {
        self.with_state(|s| s.reject_commands = code);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    pub fn reads(&self) -> usize {
        self.with_state(|s| s.reads)
    }

    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.with_state(|s| s.commands.clone())
    }

    /// Total calls that reached this device, reads and commands alike.
    pub fn network_calls(&self) -> usize {
        self.with_state(|s| s.reads + s.commands.len())
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(DeviceStatus::new(2850, false, false))
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_status(&self) -> Result<DeviceStatus> {
        let latency = self.with_state(|s| {
            s.reads += 1;
            s.latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // Outcome is decided when the reply "arrives", not when it was asked for
        self.with_state(|s| {
            if s.fail_reads {
                Err(SyncError::Transport("connection refused".to_string()))
            } else {
                Ok(s.status)
            }
        })
    }

    async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        let latency = self.with_state(|s| {
            s.commands.push(command);
            s.latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.with_state(|s| {
            if let Some(code) = s.reject_commands {
                return Err(SyncError::DeviceRejected(code));
            }
            match command {
                DeviceCommand::StartPump => s.status.pump_running = true,
                DeviceCommand::StopPump => s.status.pump_running = false,
                DeviceCommand::SetMode(mode) => s.status.auto_mode_enabled = mode == DeviceMode::Auto,
            }
            Ok(())
        })
    }
}

/// Hands out one simulated device per endpoint, created on first use.
#[derive(Debug, Default)]
pub struct SimulatedFactory {
    devices: Mutex<HashMap<String, Arc<SimulatedTransport>>>,
    connects: Mutex<Vec<String>>,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, endpoint: &str) -> Arc<SimulatedTransport> {
        let key = DeviceEndpoint::parse(endpoint)
            .map(|e| e.to_string())
            .unwrap_or_else(|_| endpoint.to_string());
        let mut devices = self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        devices.entry(key).or_default().clone()
    }

    /// Endpoints `connect` has been called with, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl TransportFactory for SimulatedFactory {
    fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Arc<dyn DeviceTransport>> {
        if let Ok(mut connects) = self.connects.lock() {
            connects.push(endpoint.to_string());
        }
        let device: Arc<dyn DeviceTransport> = self.device(&endpoint.to_string());
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_change_simulated_state() {
        let device = SimulatedTransport::default();
        device.send_command(DeviceCommand::StartPump).await.unwrap();
        assert!(device.fetch_status().await.unwrap().pump_running);

        device.send_command(DeviceCommand::SetMode(DeviceMode::Auto)).await.unwrap();
        assert!(device.fetch_status().await.unwrap().auto_mode_enabled);
        assert_eq!(device.network_calls(), 4);
    }

    #[tokio::test]
    async fn test_offline_and_rejecting_device() {
        let device = SimulatedTransport::default();
        device.set_offline(true);
        assert!(matches!(device.fetch_status().await, Err(SyncError::Transport(_))));

        device.reject_commands(Some(503));
        assert!(matches!(
            device.send_command(DeviceCommand::StopPump).await,
            Err(SyncError::DeviceRejected(503))
        ));
    }

    #[test]
    fn test_factory_shares_device_per_endpoint() {
        let factory = SimulatedFactory::new();
        let a = factory.device("192.168.1.50");
        let endpoint = DeviceEndpoint::parse("192.168.1.50").unwrap();
        factory.connect(&endpoint).unwrap();
        a.set_moisture(2600);
        assert!(Arc::ptr_eq(&a, &factory.device("192.168.1.50")));
        assert!(!Arc::ptr_eq(&a, &factory.device("192.168.1.51")));
        assert_eq!(factory.connects(), vec!["192.168.1.50".to_string()]);
    }
}
