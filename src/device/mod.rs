// src/device/mod.rs
//! Value types describing the irrigation controller and how to reach it

pub mod command;
pub mod endpoint;
pub mod status;

pub use command::{DeviceCommand, DeviceMode};
pub use endpoint::DeviceEndpoint;
pub use status::{DeviceStatus, MoistureBand, MoistureHistory, MoistureThresholds};
