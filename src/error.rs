use thiserror::Error;

use crate::device::DeviceCommand;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid endpoint '{0}': expected an IPv4 address or a broker URI")]
    InvalidEndpoint(String),

    #[error("No device endpoint configured")]
    NoEndpoint,

    #[error("Device is not connected")]
    NotConnected,

    #[error("Pump commands are disabled while automatic mode is active")]
    ModeConflict,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device rejected the request with status {0}")]
    DeviceRejected(u16),

    #[error("Malformed status payload: {0}")]
    MalformedStatus(#[from] serde_json::Error),

    #[error("Command '{command}' failed: {cause}")]
    CommandFailed {
        command: DeviceCommand,
        #[source]
        cause: Box<SyncError>,
    },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        SyncError::Transport(error.to_string())
    }
}

impl From<rumqttc::ClientError> for SyncError {
    fn from(error: rumqttc::ClientError) -> Self {
        SyncError::Transport(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_keeps_cause() {
        let err = SyncError::CommandFailed {
            command: DeviceCommand::StartPump,
            cause: Box::new(SyncError::DeviceRejected(503)),
        };
        let text = err.to_string();
        assert!(text.contains("start"));
        assert!(text.contains("503"));
    }
}
