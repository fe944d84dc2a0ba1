// src/sync/mod.rs
pub mod client;
pub mod event;
pub mod state;
pub mod task;

pub use client::{DeviceSyncClient, RefreshOutcome};
pub use event::SyncEvent;
pub use state::{ConnectionState, FailureOutcome, ReconnectPolicy, SyncSnapshot, SyncState};
pub use task::ScheduledTask;
