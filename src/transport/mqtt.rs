// src/transport/mqtt.rs
//! Publish/subscribe transport: status arrives on a topic, commands go out as
//! plain-text publishes on the control and mode topics and resolve on PubAck.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::device::{DeviceCommand, DeviceEndpoint, DeviceStatus};
use crate::error::{Result, SyncError};
use crate::transport::DeviceTransport;
use crate::{log_debug, log_error, log_info, log_warn};

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Status plus the sequence number it was received under.
type Stamped = Option<(u64, DeviceStatus)>;
type AckSender = oneshot::Sender<Result<()>>;

#[derive(Debug, Default)]
struct BrokerLink {
    connected: AtomicBool,
    last_error: StdMutex<Option<String>>,
}

impl BrokerLink {
    fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = None;
        }
    }

    fn set_failed(&self, error: String) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(error);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Option<String> {
        if self.is_connected() {
            return None;
        }
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}

#[derive(Debug, Default)]
struct AckQueue {
    // Waiting for the event loop to assign a packet id, in publish order
    queued: VecDeque<AckSender>,
    in_flight: HashMap<u16, AckSender>,
}

/// Matches QoS 1 publishes to their PubAck. The event loop hands out packet
/// ids in the order publishes were queued.
#[derive(Debug, Default)]
struct AckTracker {
    queue: StdMutex<AckQueue>,
}

impl AckTracker {
    fn with_queue<T>(&self, f: impl FnOnce(&mut AckQueue) -> T) -> T {
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut queue)
    }

    fn expect_ack(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.with_queue(|q| q.queued.push_back(tx));
        rx
    }

    /// Undo the last `expect_ack` when the publish never reached the queue.
    fn withdraw_last(&self) {
        self.with_queue(|q| q.queued.pop_back());
    }

    fn assigned(&self, pkid: u16) {
        self.with_queue(|q| {
            if let Some(tx) = q.queued.pop_front() {
                q.in_flight.insert(pkid, tx);
            }
        });
    }

    fn acked(&self, pkid: u16) {
        if let Some(tx) = self.with_queue(|q| q.in_flight.remove(&pkid)) {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&self, reason: &str) {
        let waiting: Vec<AckSender> = self.with_queue(|q| {
            let mut waiting: Vec<AckSender> = q.queued.drain(..).collect();
            waiting.extend(q.in_flight.drain().map(|(_, tx)| tx));
            waiting
        });
        for tx in waiting {
            let _ = tx.send(Err(SyncError::Transport(reason.to_string())));
        }
    }
}

/// Reader side of the status topic. A read returns at once if a status
/// arrived since the previous read, otherwise waits for the next one.
#[derive(Debug)]
struct StatusFeed {
    reader: Mutex<watch::Receiver<Stamped>>,
    latest: watch::Receiver<Stamped>,
    seen: AtomicU64,
}

impl StatusFeed {
    fn new() -> (Self, watch::Sender<Stamped>) {
        let (tx, rx) = watch::channel(None);
        let feed = Self {
            reader: Mutex::new(rx.clone()),
            latest: rx,
            seen: AtomicU64::new(0),
        };
        (feed, tx)
    }

    async fn next(&self) -> Result<DeviceStatus> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some((seq, status)) = *reader.borrow_and_update() {
                if seq > self.seen.load(Ordering::SeqCst) {
                    self.seen.fetch_max(seq, Ordering::SeqCst);
                    return Ok(status);
                }
            }
            reader
                .changed()
                .await
                .map_err(|_| SyncError::Transport("MQTT event loop stopped".to_string()))?;
        }
    }

    /// Everything received so far counts as read.
    fn mark_seen(&self) {
        if let Some((seq, _)) = *self.latest.borrow() {
            self.seen.fetch_max(seq, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Pause,
    Stop,
}

/// Everything the event loop does with a polled event.
struct EventHandler {
    client: AsyncClient,
    link: Arc<BrokerLink>,
    acks: Arc<AckTracker>,
    status_tx: watch::Sender<Stamped>,
    status_topic: String,
    broker: String,
}

impl EventHandler {
    fn handle(&self, event: std::result::Result<Event, ConnectionError>) -> Flow {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log_info!("Connected to broker {}", self.broker);
                self.link.set_connected();
                // Sessions are clean, so subscribe again on every connect
                if let Err(e) = self.client.try_subscribe(self.status_topic.as_str(), QoS::AtLeastOnce) {
                    log_error!("Subscribe to {} failed: {}", self.status_topic, e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.on_publish(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => self.acks.acked(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.acks.assigned(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log_debug!("Disconnect sent to {}", self.broker);
                self.acks.fail_all("MQTT session closed");
                return Flow::Stop;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                log_warn!("Broker {} closed the session", self.broker);
                self.link.set_failed("broker closed the session".to_string());
                self.acks.fail_all("broker closed the session");
            }
            Ok(_) => {}
            Err(e) => {
                log_warn!("MQTT connection error on {}: {}", self.broker, e);
                self.link.set_failed(e.to_string());
                self.acks.fail_all(&e.to_string());
                return Flow::Pause;
            }
        }
        Flow::Continue
    }

    fn on_publish(&self, topic: &str, payload: &[u8]) {
        if topic != self.status_topic {
            return;
        }
        match DeviceStatus::from_json(payload) {
            Ok(status) => {
                log_debug!("Status from {}: {:?}", self.broker, status);
                self.status_tx.send_modify(|current| {
                    let seq = current.map(|(seq, _)| seq + 1).unwrap_or(1);
                    *current = Some((seq, status));
                });
            }
            Err(e) => {
                log_warn!("Ignoring malformed status on {}: {}", topic, e);
            }
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    topics: MqttConfig,
    timeout: Duration,
    link: Arc<BrokerLink>,
    acks: Arc<AckTracker>,
    status: StatusFeed,
    // Keeps packet id assignment in the order acks were registered
    publishing: Mutex<()>,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("status_topic", &self.topics.status_topic)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MqttTransport {
    /// Spawns the broker event loop; must be called inside a tokio runtime.
    pub fn connect(endpoint: &DeviceEndpoint, topics: &MqttConfig, timeout: Duration) -> Result<Self> {
        let DeviceEndpoint::Broker { host, port, tls } = endpoint else {
            return Err(SyncError::InvalidEndpoint(endpoint.to_string()));
        };

        let client_id = format!("{}-{}", topics.client_id, std::process::id());
        let mut options = MqttOptions::new(client_id, host.as_str(), *port);
        options.set_keep_alive(Duration::from_secs(topics.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if *tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 20);
        let (status, status_tx) = StatusFeed::new();
        let link = Arc::new(BrokerLink::default());
        let acks = Arc::new(AckTracker::default());
        let cancel_token = CancellationToken::new();

        let handler = EventHandler {
            client: client.clone(),
            link: link.clone(),
            acks: acks.clone(),
            status_tx,
            status_topic: topics.status_topic.clone(),
            broker: endpoint.to_string(),
        };
        let task_token = cancel_token.clone();

        let event_loop = tokio::spawn(async move {
            log_info!("Starting MQTT event loop for {}", handler.broker);
            loop {
                let event = tokio::select! {
                    _ = task_token.cancelled() => break,
                    event = eventloop.poll() => event,
                };

                match handler.handle(event) {
                    Flow::Continue => {}
                    Flow::Stop => break,
                    Flow::Pause => {
                        tokio::select! {
                            _ = task_token.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                        }
                    }
                }
            }
            handler.acks.fail_all("MQTT event loop stopped");
            log_info!("MQTT event loop for {} stopped", handler.broker);
        });

        Ok(Self {
            client,
            topics: topics.clone(),
            timeout,
            link,
            acks,
            status,
            publishing: Mutex::new(()),
            event_loop: StdMutex::new(Some(event_loop)),
            cancel_token,
        })
    }

    fn route(&self, command: DeviceCommand) -> (&str, &'static str) {
        match command {
            DeviceCommand::StartPump => (self.topics.control_topic.as_str(), "start"),
            DeviceCommand::StopPump => (self.topics.control_topic.as_str(), "stop"),
            DeviceCommand::SetMode(mode) => (self.topics.mode_topic.as_str(), mode.as_wire()),
        }
    }
}

#[async_trait]
impl DeviceTransport for MqttTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_status(&self) -> Result<DeviceStatus> {
        if let Some(error) = self.link.failure() {
            return Err(SyncError::Transport(error));
        }
        self.status.next().await
    }

    async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        if let Some(error) = self.link.failure() {
            return Err(SyncError::Transport(error));
        }
        if !self.link.is_connected() {
            return Err(SyncError::Transport("broker not connected yet".to_string()));
        }

        let (topic, payload) = self.route(command);
        let ack = {
            let _publishing = self.publishing.lock().await;
            // The re-read after this command must see a status sent after it
            self.status.mark_seen();
            let ack = self.acks.expect_ack();
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
                .await
            {
                self.acks.withdraw_last();
                return Err(e.into());
            }
            ack
        };

        ack.await
            .map_err(|_| SyncError::Transport("MQTT event loop stopped".to_string()))??;
        log_debug!("Broker acknowledged '{}' on {}", payload, topic);
        Ok(())
    }

    async fn close(&self) {
        let handle = self.event_loop.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if self.link.is_connected() {
                match self.client.try_disconnect() {
                    Ok(()) => {
                        if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                            log_debug!("MQTT disconnect not flushed within {:?}", CLOSE_GRACE);
                        }
                    }
                    Err(e) => log_debug!("MQTT disconnect request failed: {}", e),
                }
            }
        }
        self.cancel_token.cancel();
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMode;
    use rumqttc::{ConnAck, ConnectReturnCode, EventLoop, PubAck};

    fn test_handler() -> (EventHandler, StatusFeed, EventLoop) {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1883), 10);
        let (feed, status_tx) = StatusFeed::new();
        let handler = EventHandler {
            client,
            link: Arc::new(BrokerLink::default()),
            acks: Arc::new(AckTracker::default()),
            status_tx,
            status_topic: "smart-irr/status".to_string(),
            broker: "mqtt://127.0.0.1".to_string(),
        };
        (handler, feed, eventloop)
    }

    #[tokio::test]
    async fn test_fresh_status_is_returned_at_once() {
        let (handler, feed, _eventloop) = test_handler();
        handler.on_publish("smart-irr/status", br#"{"moistureLevel":2850,"pumpStatus":false,"autoMode":true}"#);

        let status = tokio::time::timeout(Duration::from_millis(100), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, DeviceStatus::new(2850, false, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_waits_for_status_newer_than_last_read() {
        let (handler, feed, _eventloop) = test_handler();
        handler.on_publish("smart-irr/status", br#"{"moistureLevel":2850,"pumpStatus":false,"autoMode":false}"#);
        feed.next().await.unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(1), feed.next()).await.is_err());

        handler.on_publish("smart-irr/status", br#"{"moistureLevel":2840,"pumpStatus":true,"autoMode":false}"#);
        assert_eq!(feed.next().await.unwrap(), DeviceStatus::new(2840, true, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_before_command_is_not_taken_as_reply() {
        let (handler, feed, _eventloop) = test_handler();
        handler.on_publish("smart-irr/status", br#"{"moistureLevel":2850,"pumpStatus":false,"autoMode":false}"#);

        feed.mark_seen();
        assert!(tokio::time::timeout(Duration::from_secs(1), feed.next()).await.is_err());

        handler.on_publish("smart-irr/status", br#"{"moistureLevel":2850,"pumpStatus":true,"autoMode":false}"#);
        assert!(feed.next().await.unwrap().pump_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_foreign_publishes_are_ignored() {
        let (handler, feed, _eventloop) = test_handler();
        handler.on_publish("smart-irr/status", b"not json");
        handler.on_publish("smart-irr/status", br#"{"moistureLevel":2850}"#);
        handler.on_publish("smart-irr/other", br#"{"moistureLevel":1,"pumpStatus":true,"autoMode":true}"#);

        assert!(tokio::time::timeout(Duration::from_secs(1), feed.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_connack_marks_link_up_and_errors_pause() {
        let (handler, _feed, _eventloop) = test_handler();
        handler.link.set_failed("refused".to_string());

        let connack = ConnAck::new(ConnectReturnCode::Success, false);
        assert_eq!(handler.handle(Ok(Event::Incoming(Packet::ConnAck(connack)))), Flow::Continue);
        assert!(handler.link.is_connected());
        assert_eq!(handler.link.failure(), None);

        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(handler.handle(Err(refused)), Flow::Pause);
        assert!(handler.link.failure().is_some());
    }

    #[tokio::test]
    async fn test_puback_resolves_matching_command() {
        let (handler, _feed, _eventloop) = test_handler();
        let first = handler.acks.expect_ack();
        let second = handler.acks.expect_ack();

        handler.handle(Ok(Event::Outgoing(Outgoing::Publish(7))));
        handler.handle(Ok(Event::Outgoing(Outgoing::Publish(8))));
        handler.handle(Ok(Event::Incoming(Packet::PubAck(PubAck::new(8)))));
        assert!(second.await.unwrap().is_ok());

        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        handler.handle(Err(refused));
        assert!(matches!(first.await.unwrap(), Err(SyncError::Transport(_))));
    }

    #[tokio::test]
    async fn test_sent_disconnect_stops_loop() {
        let (handler, _feed, _eventloop) = test_handler();
        let pending = handler.acks.expect_ack();

        assert_eq!(handler.handle(Ok(Event::Outgoing(Outgoing::Disconnect))), Flow::Stop);
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_commands_route_to_topics() {
        let endpoint = DeviceEndpoint::parse("mqtt://127.0.0.1:1").unwrap();
        let transport = MqttTransport::connect(&endpoint, &MqttConfig::default(), Duration::from_secs(30)).unwrap();

        assert_eq!(transport.route(DeviceCommand::StartPump), ("smart-irr/control", "start"));
        assert_eq!(transport.route(DeviceCommand::StopPump), ("smart-irr/control", "stop"));
        assert_eq!(
            transport.route(DeviceCommand::SetMode(DeviceMode::Manual)),
            ("smart-irr/mode/set", "MANUAL")
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_fast() {
        let endpoint = DeviceEndpoint::parse("mqtt://127.0.0.1:1").unwrap();
        let transport = MqttTransport::connect(&endpoint, &MqttConfig::default(), Duration::from_secs(30)).unwrap();

        // Give the event loop a moment to hit the refused connection
        let mut outcome = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if transport.link.failure().is_some() {
                outcome = Some(transport.fetch_status().await);
                break;
            }
        }

        assert!(matches!(outcome, Some(Err(SyncError::Transport(_)))));
        assert!(matches!(
            transport.send_command(DeviceCommand::StartPump).await,
            Err(SyncError::Transport(_))
        ));
        transport.close().await;
    }

    #[test]
    fn test_rejects_http_endpoint() {
        let endpoint = DeviceEndpoint::parse("192.168.1.50").unwrap();
        assert!(matches!(
            MqttTransport::connect(&endpoint, &MqttConfig::default(), Duration::from_secs(30)),
            Err(SyncError::InvalidEndpoint(_))
        ));
    }
}
