// src/sync/state.rs
//! The client's single owned state object. Every change goes through one of
//! the transition functions here; nothing in this file touches the network.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::device::{DeviceStatus, MoistureBand, MoistureHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        };
        f.write_str(label)
    }
}

/// Fixed-delay retry with a ceiling on consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct SyncState {
    connection: ConnectionState,
    status: Option<DeviceStatus>,
    history: MoistureHistory,
    reconnect_attempts: u32,
    last_successful_sync_at: Option<DateTime<Utc>>,
    connection_lost: bool,
    // Whether the current cycle has had at least one good read
    ever_connected: bool,
    policy: ReconnectPolicy,
}

impl SyncState {
    pub fn new(policy: ReconnectPolicy, history_capacity: usize) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            status: None,
            history: MoistureHistory::new(history_capacity),
            reconnect_attempts: 0,
            last_successful_sync_at: None,
            connection_lost: false,
            ever_connected: false,
            policy,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.status
    }

    pub fn history(&self) -> &MoistureHistory {
        &self.history
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_successful_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_successful_sync_at
    }

    /// Terminal: the attempt ceiling was hit and nothing is scheduled.
    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// A different device is now targeted: nothing known so far applies to it.
    pub fn reset_for_endpoint(&mut self) {
        let capacity = self.history.capacity();
        *self = Self::new(self.policy, capacity);
        self.connection = ConnectionState::Connecting;
    }

    /// Explicit user action out of the terminal state. Keeps the last good
    /// status on display.
    pub fn restart_cycle(&mut self) {
        self.connection_lost = false;
        self.reconnect_attempts = 0;
        self.ever_connected = false;
        self.connection = ConnectionState::Connecting;
    }

    pub fn apply_success(&mut self, status: DeviceStatus, at: DateTime<Utc>) {
        self.status = Some(status);
        self.history.push(status.moisture_level);
        self.last_successful_sync_at = Some(at);
        self.reconnect_attempts = 0;
        self.connection_lost = false;
        self.ever_connected = true;
        self.connection = ConnectionState::Connected;
    }

    /// Record a failed read. Status and history are left as they were.
    pub fn apply_failure(&mut self) -> FailureOutcome {
        if self.connection_lost {
            return FailureOutcome::GaveUp {
                attempts: self.reconnect_attempts,
            };
        }

        self.reconnect_attempts = (self.reconnect_attempts + 1).min(self.policy.max_attempts);

        if self.reconnect_attempts >= self.policy.max_attempts {
            self.connection = ConnectionState::Disconnected;
            self.connection_lost = true;
            return FailureOutcome::GaveUp {
                attempts: self.reconnect_attempts,
            };
        }

        self.connection = if !self.ever_connected && self.reconnect_attempts == 1 {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Reconnecting
        };

        FailureOutcome::Retry {
            attempt: self.reconnect_attempts,
            delay: self.policy.delay,
        }
    }

    pub fn time_since_last_sync(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_successful_sync_at
            .and_then(|at| (now - at).to_std().ok())
    }
}

/// Read-only copy handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub endpoint: Option<String>,
    pub connection: ConnectionState,
    pub connection_lost: bool,
    pub status: Option<DeviceStatus>,
    pub moisture_band: Option<MoistureBand>,
    pub history: Vec<i64>,
    pub reconnect_attempts: u32,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_state() -> SyncState {
        let mut state = SyncState::new(ReconnectPolicy::default(), 10);
        state.reset_for_endpoint();
        state.apply_success(DeviceStatus::new(2850, false, false), Utc::now());
        state
    }

    #[test]
    fn test_success_replaces_status_and_resets() {
        let mut state = SyncState::new(ReconnectPolicy::default(), 10);
        state.reset_for_endpoint();
        assert_eq!(state.connection(), ConnectionState::Connecting);

        state.apply_success(DeviceStatus::new(2850, false, false), Utc::now());
        assert_eq!(state.connection(), ConnectionState::Connected);
        assert_eq!(state.status(), Some(DeviceStatus::new(2850, false, false)));
        assert_eq!(state.history().to_vec(), vec![2850]);
        assert!(state.last_successful_sync_at().is_some());
    }

    #[test]
    fn test_first_failure_without_connection_is_disconnected() {
        let mut state = SyncState::new(ReconnectPolicy::default(), 10);
        state.reset_for_endpoint();

        let outcome = state.apply_failure();
        assert_eq!(outcome, FailureOutcome::Retry { attempt: 1, delay: Duration::from_secs(5) });
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(!state.is_connection_lost());

        state.apply_failure();
        assert_eq!(state.connection(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_three_failures_from_connected_give_up() {
        let mut state = connected_state();
        let before = state.status();

        assert!(matches!(state.apply_failure(), FailureOutcome::Retry { attempt: 1, .. }));
        assert_eq!(state.connection(), ConnectionState::Reconnecting);
        assert!(matches!(state.apply_failure(), FailureOutcome::Retry { attempt: 2, .. }));
        assert_eq!(state.apply_failure(), FailureOutcome::GaveUp { attempts: 3 });

        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(state.is_connection_lost());
        assert_eq!(state.status(), before);
        assert_eq!(state.history().len(), 1);

        // Further failures never push the counter past the ceiling
        assert_eq!(state.apply_failure(), FailureOutcome::GaveUp { attempts: 3 });
        assert_eq!(state.reconnect_attempts(), 3);
    }

    #[test]
    fn test_success_mid_cycle_resets_counter() {
        let mut state = connected_state();
        state.apply_failure();
        state.apply_failure();
        assert_eq!(state.reconnect_attempts(), 2);

        state.apply_success(DeviceStatus::new(2790, true, false), Utc::now());
        assert_eq!(state.reconnect_attempts(), 0);
        assert_eq!(state.connection(), ConnectionState::Connected);
        assert_eq!(state.history().to_vec(), vec![2850, 2790]);
    }

    #[test]
    fn test_restart_cycle_leaves_terminal_state() {
        let mut state = connected_state();
        for _ in 0..3 {
            state.apply_failure();
        }
        assert!(state.is_connection_lost());

        state.restart_cycle();
        assert!(!state.is_connection_lost());
        assert_eq!(state.reconnect_attempts(), 0);
        assert_eq!(state.connection(), ConnectionState::Connecting);
        assert!(state.status().is_some());
    }

    #[test]
    fn test_reset_for_endpoint_forgets_previous_device() {
        let mut state = connected_state();
        state.reset_for_endpoint();
        assert_eq!(state.status(), None);
        assert!(state.history().is_empty());
        assert_eq!(state.history().capacity(), 10);
    }

    #[test]
    fn test_time_since_last_sync() {
        let mut state = SyncState::new(ReconnectPolicy::default(), 10);
        let at = Utc::now();
        assert_eq!(state.time_since_last_sync(at), None);

        state.apply_success(DeviceStatus::new(2850, false, false), at);
        let later = at + chrono::Duration::seconds(42);
        assert_eq!(state.time_since_last_sync(later), Some(Duration::from_secs(42)));
    }
}
