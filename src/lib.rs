pub mod config;
pub mod device;
pub mod error;
pub mod sync;
pub mod transport;
pub mod util;

pub use config::SyncConfig;
pub use device::{DeviceCommand, DeviceEndpoint, DeviceMode, DeviceStatus};
pub use error::{Result, SyncError};
pub use sync::{ConnectionState, DeviceSyncClient, RefreshOutcome, SyncEvent};
