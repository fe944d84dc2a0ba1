// src/sync/client.rs
//! DeviceSyncClient - best-effort mirror of the controller's state with
//! reconnect/backoff and serialized command dispatch

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::device::{DeviceCommand, DeviceEndpoint, DeviceMode, DeviceStatus};
use crate::error::{Result, SyncError};
use crate::sync::event::SyncEvent;
use crate::sync::state::{ConnectionState, FailureOutcome, ReconnectPolicy, SyncSnapshot, SyncState};
use crate::sync::task::{sleep_or_cancel, ScheduledTask};
use crate::transport::{DefaultTransportFactory, DeviceTransport, TransportFactory};
use crate::util::database::EndpointStore;
use crate::util::io::bus::{EventBus, EventReceiver};
use crate::{log_debug, log_error, log_info, log_warn};

/// Result of a refresh that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated(DeviceStatus),
    /// Another refresh for the same endpoint was already in flight.
    Skipped,
    /// The endpoint changed while the read was outstanding; the reply was dropped.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Endpoint,
    Manual,
    Poll,
    Retry,
    AfterCommand,
}

#[derive(Clone)]
struct Session {
    epoch: u64,
    endpoint: DeviceEndpoint,
    transport: Arc<dyn DeviceTransport>,
}

struct Core {
    state: SyncState,
    session: Option<Session>,
    // Bumped on every endpoint change and on shutdown
    epoch: u64,
    in_flight: Option<u64>,
    retry: Option<ScheduledTask>,
    poller: Option<ScheduledTask>,
}

struct Inner {
    config: SyncConfig,
    factory: Arc<dyn TransportFactory>,
    store: Arc<dyn EndpointStore>,
    bus: EventBus,
    core: Mutex<Core>,
    idle: Notify,
    // Held across persist and swap so the store always names the active endpoint
    configuring: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct DeviceSyncClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSyncClient")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

enum Slot {
    Taken(InFlightGuard),
    Busy,
    Stale,
}

/// Marks the refresh slot for one epoch as taken until dropped.
struct InFlightGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        {
            let mut core = lock(&self.inner.core);
            if core.in_flight == Some(self.epoch) {
                core.in_flight = None;
            }
        }
        self.inner.idle.notify_waiters();
    }
}

fn lock(core: &Mutex<Core>) -> MutexGuard<'_, Core> {
    core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceSyncClient {
    pub fn new(config: SyncConfig, factory: Arc<dyn TransportFactory>, store: Arc<dyn EndpointStore>) -> Self {
        let policy = ReconnectPolicy {
            max_attempts: config.max_reconnect_attempts.max(1),
            delay: config.retry_delay(),
        };
        let state = SyncState::new(policy, config.history_capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                store,
                bus: EventBus::new(),
                core: Mutex::new(Core {
                    state,
                    session: None,
                    epoch: 0,
                    in_flight: None,
                    retry: None,
                    poller: None,
                }),
                idle: Notify::new(),
                configuring: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// HTTP for IPv4 endpoints, MQTT for broker URIs.
    pub fn with_default_transports(config: SyncConfig, store: Arc<dyn EndpointStore>) -> Self {
        let factory = Arc::new(DefaultTransportFactory::new(config.clone()));
        Self::new(config, factory, store)
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.inner.core)
    }

    fn publish(&self, events: Vec<SyncEvent>) {
        for event in events {
            self.inner.bus.publish(event);
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let core = self.core();
        let state = &core.state;
        SyncSnapshot {
            endpoint: core.session.as_ref().map(|s| s.endpoint.to_string()),
            connection: state.connection(),
            connection_lost: state.is_connection_lost(),
            status: state.status(),
            moisture_band: state
                .status()
                .map(|s| self.inner.config.moisture.classify(s.moisture_level)),
            history: state.history().to_vec(),
            reconnect_attempts: state.reconnect_attempts(),
            last_successful_sync_at: state.last_successful_sync_at(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core().state.connection()
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.core().state.status()
    }

    pub fn endpoint(&self) -> Option<DeviceEndpoint> {
        self.core().session.as_ref().map(|s| s.endpoint.clone())
    }

    pub fn time_since_last_sync(&self) -> Option<Duration> {
        self.core().state.time_since_last_sync(Utc::now())
    }

    pub fn is_polling(&self) -> bool {
        self.core().poller.is_some()
    }

    /// Validate, persist and switch to a new endpoint, then sync with it.
    /// A failing first read is not an error here; it enters the retry cycle.
    pub async fn configure(&self, input: &str) -> Result<()> {
        let endpoint = DeviceEndpoint::parse(input)?;
        let configuring = self.inner.configuring.lock().await;
        let transport = self.inner.factory.connect(&endpoint)?;

        if let Err(e) = self.persist(&endpoint).await {
            log_error!("Failed to persist endpoint {}: {}", endpoint, e);
            transport.close().await;
            return Err(e);
        }

        let (previous, session) = {
            let mut core = self.core();
            core.epoch += 1;
            core.retry = None;
            let from = core.state.connection();
            core.state.reset_for_endpoint();
            let session = Session {
                epoch: core.epoch,
                endpoint: endpoint.clone(),
                transport,
            };
            let previous = core.session.replace(session.clone());
            self.publish(vec![
                SyncEvent::EndpointChanged(endpoint.to_string()),
                SyncEvent::ConnectionChanged {
                    from,
                    to: ConnectionState::Connecting,
                    attempts: 0,
                },
            ]);
            (previous, session)
        };
        drop(configuring);
        // Wake command follow-ups parked on the old endpoint's slot
        self.inner.idle.notify_waiters();

        log_info!("Device endpoint set to {} via {}", endpoint, session.transport.name());

        if let Some(previous) = previous {
            previous.transport.close().await;
        }

        if let Err(e) = self.refresh_session(session, Trigger::Endpoint).await {
            log_warn!("Initial sync with {} failed: {}", endpoint, e);
        }
        Ok(())
    }

    async fn persist(&self, endpoint: &DeviceEndpoint) -> Result<()> {
        let store = self.inner.store.clone();
        let value = endpoint.to_string();
        tokio::task::spawn_blocking(move || store.save_endpoint(&value))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }

    /// Configure whatever endpoint was persisted last, falling back to the
    /// one in the config. Returns the endpoint that was applied, if any.
    pub async fn restore(&self) -> Result<Option<DeviceEndpoint>> {
        let saved = self.inner.store.load_endpoint()?;
        let Some(input) = saved.or_else(|| self.inner.config.endpoint.clone()) else {
            log_info!("No saved device endpoint");
            return Ok(None);
        };

        self.configure(&input).await?;
        Ok(self.endpoint())
    }

    /// User-triggered read. Also the way out of the terminal disconnected
    /// state: it starts a fresh connection cycle.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let session = {
            let mut core = self.core();
            let session = core.session.clone().ok_or(SyncError::NoEndpoint)?;
            if core.state.is_connection_lost() {
                let from = core.state.connection();
                core.state.restart_cycle();
                log_info!("Reconnect requested for {}", session.endpoint);
                self.publish(vec![SyncEvent::ConnectionChanged {
                    from,
                    to: ConnectionState::Connecting,
                    attempts: 0,
                }]);
            }
            session
        };
        self.refresh_session(session, Trigger::Manual).await
    }

    /// Only the current epoch may take the slot.
    fn try_begin(&self, epoch: u64) -> Slot {
        let mut core = self.core();
        if core.epoch != epoch {
            return Slot::Stale;
        }
        if core.in_flight == Some(epoch) {
            return Slot::Busy;
        }
        core.in_flight = Some(epoch);
        Slot::Taken(InFlightGuard {
            inner: self.inner.clone(),
            epoch,
        })
    }

    /// `None` once the endpoint has changed underneath the waiter.
    async fn wait_for_slot(&self, epoch: u64) -> Option<InFlightGuard> {
        loop {
            let notified = self.inner.idle.notified();
            match self.try_begin(epoch) {
                Slot::Taken(guard) => return Some(guard),
                Slot::Stale => return None,
                Slot::Busy => notified.await,
            }
        }
    }

    async fn refresh_session(&self, session: Session, trigger: Trigger) -> Result<RefreshOutcome> {
        let slot = match trigger {
            Trigger::AfterCommand => match self.wait_for_slot(session.epoch).await {
                Some(guard) => Slot::Taken(guard),
                None => Slot::Stale,
            },
            _ => self.try_begin(session.epoch),
        };
        let guard = match slot {
            Slot::Taken(guard) => guard,
            Slot::Busy => {
                log_debug!("Refresh ({:?}) skipped, one is already in flight", trigger);
                return Ok(RefreshOutcome::Skipped);
            }
            Slot::Stale => {
                log_debug!("Refresh ({:?}) for {} dropped, endpoint changed", trigger, session.endpoint);
                return Ok(RefreshOutcome::Superseded);
            }
        };

        log_debug!("Refreshing {} ({:?})", session.endpoint, trigger);
        let bound = session.transport.timeout();
        let result = match tokio::time::timeout(bound, session.transport.fetch_status()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(bound)),
        };
        drop(guard);

        match result {
            Ok(status) => Ok(self.apply_success(&session, status)),
            Err(e) => {
                if self.apply_failure(&session, &e) {
                    Err(e)
                } else {
                    Ok(RefreshOutcome::Superseded)
                }
            }
        }
    }

    fn apply_success(&self, session: &Session, status: DeviceStatus) -> RefreshOutcome {
        let mut core = self.core();
        if core.epoch != session.epoch {
            log_debug!("Dropping status from superseded endpoint {}", session.endpoint);
            return RefreshOutcome::Superseded;
        }

        let from = core.state.connection();
        let at = Utc::now();
        core.state.apply_success(status, at);
        core.retry = None;

        let mut events = Vec::new();
        if from != ConnectionState::Connected {
            log_info!("Connected to {}", session.endpoint);
            events.push(SyncEvent::ConnectionChanged {
                from,
                to: ConnectionState::Connected,
                attempts: 0,
            });
        }
        events.push(SyncEvent::StatusUpdated {
            status,
            band: self.inner.config.moisture.classify(status.moisture_level),
            at,
        });
        drop(core);

        self.publish(events);
        RefreshOutcome::Updated(status)
    }

    /// Returns `false` when the failure belonged to a superseded endpoint.
    fn apply_failure(&self, session: &Session, error: &SyncError) -> bool {
        let mut core = self.core();
        if core.epoch != session.epoch {
            log_debug!("Ignoring failure from superseded endpoint {}", session.endpoint);
            return false;
        }

        let from = core.state.connection();
        let was_lost = core.state.is_connection_lost();
        let outcome = core.state.apply_failure();
        let to = core.state.connection();
        let attempts = core.state.reconnect_attempts();

        let mut events = Vec::new();
        if from != to {
            events.push(SyncEvent::ConnectionChanged { from, to, attempts });
        }

        match outcome {
            FailureOutcome::Retry { attempt, delay } => {
                log_warn!(
                    "Sync with {} failed ({}), retry {} in {:?}",
                    session.endpoint,
                    error,
                    attempt,
                    delay
                );
                core.retry = Some(self.schedule_retry(session.epoch, delay));
                events.push(SyncEvent::RetryScheduled { attempt, delay });
            }
            FailureOutcome::GaveUp { attempts } => {
                core.retry = None;
                if !was_lost {
                    let message = format!(
                        "Connection to {} lost after {} attempts: {}",
                        session.endpoint, attempts, error
                    );
                    log_error!("{}", message);
                    events.push(SyncEvent::ConnectionLost { message });
                }
            }
        }
        drop(core);

        self.publish(events);
        true
    }

    fn schedule_retry(&self, epoch: u64, delay: Duration) -> ScheduledTask {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        ScheduledTask::spawn(move |token| async move {
            if !sleep_or_cancel(&token, delay).await {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            DeviceSyncClient { inner }.run_retry(epoch).await;
        })
    }

    async fn run_retry(&self, epoch: u64) {
        let session = {
            let mut core = self.core();
            if core.epoch != epoch || core.state.is_connection_lost() {
                return;
            }
            // This task is the one being released
            core.retry = None;
            match core.session.clone() {
                Some(session) => session,
                None => return,
            }
        };
        let _ = self.refresh_session(session, Trigger::Retry).await;
    }

    /// Periodic refresh. Ticks are dropped while a read is in flight, while a
    /// retry is pending, or once the connection is lost.
    pub fn start_polling(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(SyncError::Config("poll interval must be greater than zero".to_string()));
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = ScheduledTask::spawn(move |token| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = DeviceSyncClient { inner };
                if let Some(session) = client.poll_target() {
                    if let Err(e) = client.refresh_session(session, Trigger::Poll).await {
                        log_debug!("Poll failed: {}", e);
                    }
                }
            }
        });

        log_info!("Polling every {:?}", interval);
        self.core().poller = Some(task);
        Ok(())
    }

    pub fn stop_polling(&self) {
        if self.core().poller.take().is_some() {
            log_info!("Polling stopped");
        }
    }

    fn poll_target(&self) -> Option<Session> {
        let core = self.core();
        let session = core.session.clone()?;
        let idle = core.in_flight != Some(session.epoch);
        if idle && core.retry.is_none() && !core.state.is_connection_lost() {
            Some(session)
        } else {
            None
        }
    }

    /// Send a command, then re-read the device. Local gating happens before
    /// anything touches the network.
    pub async fn dispatch_command(&self, command: DeviceCommand) -> Result<RefreshOutcome> {
        let session = {
            let core = self.core();
            let session = core.session.clone().ok_or(SyncError::NotConnected)?;
            if core.state.connection() != ConnectionState::Connected {
                return Err(SyncError::NotConnected);
            }
            let auto_mode = core.state.status().map(|s| s.auto_mode_enabled).unwrap_or(false);
            if command.is_manual_pump_command() && auto_mode {
                return Err(SyncError::ModeConflict);
            }
            session
        };

        if let DeviceCommand::SetMode(mode) = command {
            if self.inner.config.optimistic_mode_events {
                self.publish(vec![SyncEvent::ModePending(mode)]);
            }
        }

        log_info!("Sending '{}' to {}", command, session.endpoint);
        let bound = session.transport.timeout();
        let sent = match tokio::time::timeout(bound, session.transport.send_command(command)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(bound)),
        };

        if let Err(cause) = sent {
            log_warn!("Command '{}' failed: {}", command, cause);
            self.publish(vec![SyncEvent::CommandFailed {
                command,
                error: cause.to_string(),
            }]);
            return Err(SyncError::CommandFailed {
                command,
                cause: Box::new(cause),
            });
        }

        self.publish(vec![SyncEvent::CommandSent(command)]);
        self.refresh_session(session, Trigger::AfterCommand).await
    }

    pub async fn toggle_pump(&self) -> Result<RefreshOutcome> {
        let status = self.status().ok_or(SyncError::NotConnected)?;
        let command = if status.pump_running {
            DeviceCommand::StopPump
        } else {
            DeviceCommand::StartPump
        };
        self.dispatch_command(command).await
    }

    pub async fn toggle_mode(&self) -> Result<RefreshOutcome> {
        let status = self.status().ok_or(SyncError::NotConnected)?;
        let mode = DeviceMode::from_auto_flag(status.auto_mode_enabled).toggled();
        self.dispatch_command(DeviceCommand::SetMode(mode)).await
    }

    /// Stop polling and timers and release the transport. The client can be
    /// brought back with `configure` or `restore`.
    pub async fn shutdown(&self) {
        let session = {
            let mut core = self.core();
            core.epoch += 1;
            core.poller = None;
            core.retry = None;
            let from = core.state.connection();
            let policy = core.state.policy();
            let capacity = core.state.history().capacity();
            core.state = SyncState::new(policy, capacity);
            let session = core.session.take();
            if session.is_some() && from != ConnectionState::Disconnected {
                self.publish(vec![SyncEvent::ConnectionChanged {
                    from,
                    to: ConnectionState::Disconnected,
                    attempts: 0,
                }]);
            }
            session
        };

        if let Some(session) = session {
            log_info!("Closing connection to {}", session.endpoint);
            session.transport.close().await;
        }
    }
}
