// src/device/command.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceMode {
    Auto,
    Manual,
}

impl DeviceMode {
    pub fn as_wire(&self) -> &'static str {
        match self {
            DeviceMode::Auto => "AUTO",
            DeviceMode::Manual => "MANUAL",
        }
    }

    pub fn from_auto_flag(auto_mode_enabled: bool) -> Self {
        if auto_mode_enabled {
            DeviceMode::Auto
        } else {
            DeviceMode::Manual
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            DeviceMode::Auto => DeviceMode::Manual,
            DeviceMode::Manual => DeviceMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    StartPump,
    StopPump,
    SetMode(DeviceMode),
}

impl DeviceCommand {
    /// Pump commands are the ones gated by automatic mode.
    pub fn is_manual_pump_command(&self) -> bool {
        matches!(self, DeviceCommand::StartPump | DeviceCommand::StopPump)
    }
}

impl std::fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceCommand::StartPump => write!(f, "start pump"),
            DeviceCommand::StopPump => write!(f, "stop pump"),
            DeviceCommand::SetMode(mode) => write!(f, "set mode {}", mode.as_wire()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serializes_uppercase() {
        let body = serde_json::json!({ "mode": DeviceMode::Auto });
        assert_eq!(body.to_string(), r#"{"mode":"AUTO"}"#);
        assert_eq!(DeviceMode::Manual.as_wire(), "MANUAL");
    }

    #[test]
    fn test_mode_toggle() {
        assert_eq!(DeviceMode::from_auto_flag(true).toggled(), DeviceMode::Manual);
        assert_eq!(DeviceMode::from_auto_flag(false).toggled(), DeviceMode::Auto);
    }

    #[test]
    fn test_only_pump_commands_are_gated() {
        assert!(DeviceCommand::StartPump.is_manual_pump_command());
        assert!(DeviceCommand::StopPump.is_manual_pump_command());
        assert!(!DeviceCommand::SetMode(DeviceMode::Manual).is_manual_pump_command());
    }
}
