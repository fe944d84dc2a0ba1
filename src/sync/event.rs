// src/sync/event.rs
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::device::{DeviceCommand, DeviceMode, DeviceStatus, MoistureBand};
use crate::sync::state::ConnectionState;

/// What observers of a `DeviceSyncClient` get told about.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    EndpointChanged(String),
    StatusUpdated {
        status: DeviceStatus,
        band: MoistureBand,
        at: DateTime<Utc>,
    },
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
        attempts: u32,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Attempt ceiling reached; only an explicit refresh or a new endpoint
    /// brings the client back.
    ConnectionLost {
        message: String,
    },
    /// Published ahead of a mode command when optimistic mode events are on.
    ModePending(DeviceMode),
    CommandSent(DeviceCommand),
    CommandFailed {
        command: DeviceCommand,
        error: String,
    },
}
