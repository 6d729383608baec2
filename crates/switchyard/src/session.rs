//! One transport connection to an MQTT broker.
//!
//! Architecture: reactor pattern to avoid lock contention. The rumqttc
//! event loop is owned by a dedicated I/O task spawned from [`BrokerSession::start`];
//! callers talk to the broker through the cloneable `AsyncClient` handle and
//! observe connection state through the shared [`SessionState`].
//!
//! State machine:
//!
//! ```text
//!          connect()                  transport_up
//! Disconnected -----> Connecting ----------------> Connected
//!      ^                  |                           |
//!      | stop()           | failure                   | transport_down
//!      |                  v                           v
//!      +------------ Reconnecting <------------ (auto_reconnect?)
//!                         | give_up
//!                         v
//!                       Error
//! ```
//!
//! Every (re)connect re-applies the entire subscription set before the
//! state is reported Connected; reconnection backoff doubles per failure,
//! clamped to the configured ceiling, and is preempted by `stop()`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::tls;
use yardconf::BrokerConfig;

/// Capacity of the rumqttc request channel between AsyncClient and EventLoop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Connection state of a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

/// Snapshot of session counters. Counters are monotonic; the snapshot is
/// copied atomically under the stats lock.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub notifications_sent: u64,
    pub errors: u64,
    pub connection_count: u64,
    pub uptime_seconds: u64,
    /// Milliseconds since the Unix epoch of the last inbound or outbound
    /// activity, if any.
    pub last_activity_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct StatsInner {
    messages_sent: u64,
    messages_received: u64,
    requests_sent: u64,
    responses_received: u64,
    notifications_sent: u64,
    errors: u64,
    connection_count: u64,
    last_activity_ms: Option<i64>,
}

pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// State shared between the session handle and its I/O task.
struct SessionShared {
    name: String,
    state: Mutex<ConnectionState>,
    subscriptions: Mutex<HashMap<String, QoS>>,
    stats: Mutex<StatsInner>,
    message_handler: Mutex<Option<MessageHandler>>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    started_at: Instant,
}

impl SessionShared {
    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                false
            } else {
                trace!("{}: {} -> {}", self.name, state.as_str(), next.as_str());
                *state = next;
                true
            }
        };
        if changed {
            // Callback fires outside the state lock.
            let callback = self
                .connection_callback
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(cb) = callback {
                cb(next);
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_activity_ms = Some(chrono::Utc::now().timestamp_millis());
    }

    fn with_stats(&self, f: impl FnOnce(&mut StatsInner)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
        stats.last_activity_ms = Some(chrono::Utc::now().timestamp_millis());
    }
}

/// Doubling backoff clamped between the configured floor and ceiling.
/// Reset to the floor on every successful connect.
struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min_secs: u64, max_secs: u64) -> Self {
        let min = Duration::from_secs(min_secs);
        Self {
            current: min,
            min,
            max: Duration::from_secs(max_secs),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Owning handle of a single broker connection plus its subscription and
/// dispatch machinery.
pub struct BrokerSession {
    config: BrokerConfig,
    client: AsyncClient,
    shared: Arc<SessionShared>,
    event_loop: Mutex<Option<EventLoop>>,
    io_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    heartbeat_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl BrokerSession {
    /// Build a session from validated config. No I/O happens until
    /// [`start`](Self::start).
    pub fn new(config: BrokerConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(config.keepalive));
        options.set_clean_session(config.clean_session);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_transport(tls::build_transport(&config)?);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let shared = Arc::new(SessionShared {
            name: config.client_id.clone(),
            state: Mutex::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsInner::default()),
            message_handler: Mutex::new(None),
            connection_callback: Mutex::new(None),
            started_at: Instant::now(),
        });

        info!(
            "{}: session created for {}:{}",
            config.client_id, config.broker_host, config.broker_port
        );

        Ok(Self {
            config,
            client,
            shared,
            event_loop: Mutex::new(Some(event_loop)),
            io_handle: Mutex::new(None),
            heartbeat_handle: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Announce intent to connect. The transport connects when the I/O loop
    /// first polls; this advances the state machine so callers and the
    /// connection callback observe Connecting before transport_up.
    pub fn connect(&self) {
        self.shared.set_state(ConnectionState::Connecting);
    }

    /// Ask the broker to drop the connection and mark the session
    /// Disconnected.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))?;
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Spawn the background I/O loop that drives ingress delivery,
    /// reconnection, and (if configured) the heartbeat.
    pub fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ClientError::AlreadyStarted)?;

        let mut network_options = rumqttc::NetworkOptions::new();
        network_options.set_connection_timeout(self.config.connect_timeout);
        event_loop.set_network_options(network_options);

        self.connect();

        let shared = self.shared.clone();
        let client = self.client.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            io_loop(event_loop, client, shared, config, cancel).await;
        });
        *self.io_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        if self.config.heartbeat.is_some() {
            self.start_heartbeat();
        }
        Ok(())
    }

    /// Halt the I/O loop. Preempts any backoff sleep in progress.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.stop_heartbeat();
        let handle = self
            .io_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("{}: session stopped", self.shared.name);
    }

    /// Publish raw bytes. Fails with `NotConnected` when the session is not
    /// Connected; retries are a higher-layer concern.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.client
            .publish(topic, qos, false, payload.to_vec())
            .await
            .map_err(|e| {
                self.shared.with_stats(|s| s.errors += 1);
                ClientError::Publish(e.to_string())
            })?;
        self.shared.with_stats(|s| s.messages_sent += 1);
        trace!("{}: published to {}", self.shared.name, topic);
        Ok(())
    }

    /// Record a subscription and, when connected, send it immediately.
    ///
    /// The pattern is persisted in the subscription set and re-applied on
    /// every reconnect.
    pub async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), ClientError> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), qos);

        if self.state() == ConnectionState::Connected {
            self.client
                .subscribe(pattern, qos)
                .await
                .map_err(|e| ClientError::Subscribe(e.to_string()))?;
        }
        debug!("{}: subscription recorded: {}", self.shared.name, pattern);
        Ok(())
    }

    /// Forget a subscription and, when connected, unsubscribe immediately.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), ClientError> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pattern);

        if self.state() == ConnectionState::Connected {
            self.client
                .unsubscribe(pattern)
                .await
                .map_err(|e| ClientError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Install the handler for inbound messages not consumed upstream.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self
            .shared
            .message_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Install a callback fired on every connection-state transition.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self
            .shared
            .connection_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Default QoS from config, as the transport type.
    pub fn default_qos(&self) -> QoS {
        qos_from_u8(self.config.qos)
    }

    /// Snapshot of the session counters.
    pub fn statistics(&self) -> SessionStats {
        let stats = self
            .shared
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        SessionStats {
            messages_sent: stats.messages_sent,
            messages_received: stats.messages_received,
            requests_sent: stats.requests_sent,
            responses_received: stats.responses_received,
            notifications_sent: stats.notifications_sent,
            errors: stats.errors,
            connection_count: stats.connection_count,
            uptime_seconds: self.shared.started_at.elapsed().as_secs(),
            last_activity_ms: stats.last_activity_ms,
        }
    }

    /// Start the heartbeat task. Idempotent; a no-op without heartbeat
    /// config or when already running.
    pub fn start_heartbeat(&self) {
        let Some(heartbeat) = self.config.heartbeat.clone() else {
            return;
        };
        let mut slot = self
            .heartbeat_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let client = self.client.clone();
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(heartbeat.interval_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                "{}: heartbeat task started ({}s -> {})",
                shared.name, heartbeat.interval_seconds, heartbeat.topic
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // Never publish through a disconnected state; skip
                        // the beat and wait for reconnection instead.
                        if shared.state() != ConnectionState::Connected {
                            continue;
                        }
                        match client
                            .publish(
                                heartbeat.topic.clone(),
                                QoS::AtMostOnce,
                                false,
                                heartbeat.payload.clone().into_bytes(),
                            )
                            .await
                        {
                            Ok(()) => shared.with_stats(|s| s.messages_sent += 1),
                            Err(e) => {
                                debug!("{}: heartbeat publish failed: {}", shared.name, e);
                                shared.with_stats(|s| s.errors += 1);
                            }
                        }
                    }
                }
            }
            debug!("{}: heartbeat task exiting", shared.name);
        });
        *slot = Some(handle);
    }

    /// Stop the heartbeat task. Idempotent.
    pub fn stop_heartbeat(&self) {
        let handle = self
            .heartbeat_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub(crate) fn record_request_sent(&self) {
        self.shared.with_stats(|s| s.requests_sent += 1);
    }

    pub(crate) fn record_response_received(&self) {
        self.shared.with_stats(|s| s.responses_received += 1);
    }

    pub(crate) fn record_notification_sent(&self) {
        self.shared.with_stats(|s| s.notifications_sent += 1);
    }
}

/// Map a validated config QoS (0-2) to the transport type.
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// The I/O loop. Owns the event loop, drives connection, re-subscription,
/// ingress dispatch, and bounded-backoff reconnection.
async fn io_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    shared: Arc<SessionShared>,
    config: BrokerConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(config.reconnect_delay_min, config.reconnect_delay_max);
    // SubAcks outstanding before the session may report Connected.
    let mut pending_subacks: usize = 0;

    debug!("{}: I/O loop started", shared.name);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{}: I/O loop cancelled", shared.name);
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        warn!("{}: connection rejected: {:?}", shared.name, ack.code);
                        shared.with_stats(|s| s.errors += 1);
                        if !config.auto_reconnect {
                            shared.set_state(ConnectionState::Error);
                            break;
                        }
                        shared.set_state(ConnectionState::Reconnecting);
                        if sleep_backoff(&mut backoff, &cancel, &shared.name).await {
                            break;
                        }
                        continue;
                    }

                    // Re-apply the whole subscription set before reporting
                    // Connected. Snapshot under lock, subscribe outside it.
                    let subs: Vec<(String, QoS)> = shared
                        .subscriptions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .iter()
                        .map(|(pattern, qos)| (pattern.clone(), *qos))
                        .collect();

                    pending_subacks = subs.len();
                    for (pattern, qos) in subs {
                        if let Err(e) = client.subscribe(pattern.clone(), qos).await {
                            warn!("{}: re-subscribe {} failed: {}", shared.name, pattern, e);
                            shared.with_stats(|s| s.errors += 1);
                            pending_subacks = pending_subacks.saturating_sub(1);
                        }
                    }

                    shared.with_stats(|s| s.connection_count += 1);
                    backoff.reset();

                    if pending_subacks == 0 {
                        shared.set_state(ConnectionState::Connected);
                        info!("{}: connected", shared.name);
                    } else {
                        debug!(
                            "{}: transport up, awaiting {} suback(s)",
                            shared.name, pending_subacks
                        );
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    if pending_subacks > 0 {
                        pending_subacks -= 1;
                        if pending_subacks == 0 && shared.state() != ConnectionState::Connected {
                            shared.set_state(ConnectionState::Connected);
                            info!("{}: connected (subscriptions restored)", shared.name);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    shared.with_stats(|s| s.messages_received += 1);
                    let handler = shared
                        .message_handler
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    if let Some(handler) = handler {
                        handler(&publish.topic, &publish.payload);
                    } else {
                        trace!("{}: dropping message on {} (no handler)", shared.name, publish.topic);
                    }
                }
                Ok(_) => {
                    shared.touch();
                }
                Err(e) => {
                    shared.with_stats(|s| s.errors += 1);
                    if !config.auto_reconnect {
                        warn!("{}: transport error, giving up: {}", shared.name, e);
                        shared.set_state(ConnectionState::Error);
                        break;
                    }
                    warn!(
                        "{}: transport error: {} (reconnecting)",
                        shared.name, e
                    );
                    shared.set_state(ConnectionState::Reconnecting);
                    pending_subacks = 0;
                    if sleep_backoff(&mut backoff, &cancel, &shared.name).await {
                        break;
                    }
                }
            }
        }
    }

    debug!("{}: I/O loop exiting", shared.name);
}

/// Sleep the current backoff delay. Returns true when cancelled - the
/// shutdown flag preempts the sleep.
async fn sleep_backoff(backoff: &mut Backoff, cancel: &CancellationToken, name: &str) -> bool {
    let delay = backoff.next_delay();
    debug!("{}: backing off {:?} before reconnect", name, delay);
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.client_id = "test-session".to_string();
        config
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut backoff = Backoff::new(1, 8);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        // Clamped at the ceiling from here on.
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn backoff_resets_to_floor() {
        let mut backoff = Backoff::new(2, 60);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn new_session_starts_disconnected() {
        let session = BrokerSession::new(test_config()).unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.statistics().connection_count, 0);
    }

    #[tokio::test]
    async fn connect_advances_state_and_fires_callback() {
        let session = BrokerSession::new(test_config()).unwrap();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        session.set_connection_callback(Arc::new(move |state| {
            seen.lock().unwrap().push(state);
        }));

        session.connect();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(
            *transitions.lock().unwrap(),
            vec![ConnectionState::Connecting]
        );

        // Same-state transition does not re-fire the callback.
        session.connect();
        assert_eq!(transitions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails() {
        let session = BrokerSession::new(test_config()).unwrap();
        let err = session
            .publish("a/b", b"payload", QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn subscriptions_persist_while_disconnected() {
        let session = BrokerSession::new(test_config()).unwrap();
        session.subscribe("a/+", QoS::AtLeastOnce).await.unwrap();
        session.subscribe("b/#", QoS::AtMostOnce).await.unwrap();
        session.subscribe("a/+", QoS::AtLeastOnce).await.unwrap();

        let subs = session.shared.subscriptions.lock().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs.get("a/+"), Some(&QoS::AtLeastOnce));

        drop(subs);
        session.unsubscribe("a/+").await.unwrap();
        assert_eq!(session.shared.subscriptions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let session = Arc::new(BrokerSession::new(test_config()).unwrap());
        session.start().unwrap();
        assert!(matches!(
            session.start(),
            Err(ClientError::AlreadyStarted)
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_preempts_backoff() {
        // The configured broker does not exist, so the loop lives in its
        // backoff path; stop() must still return promptly.
        let mut config = test_config();
        config.broker_host = "127.0.0.1".to_string();
        config.broker_port = 1; // nothing listens here
        config.reconnect_delay_min = 30;
        config.reconnect_delay_max = 60;

        let session = Arc::new(BrokerSession::new(config).unwrap());
        session.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), session.stop()).await;
        assert!(stopped.is_ok(), "stop() blocked on the backoff sleep");
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn message_handler_receives_dispatch() {
        let session = BrokerSession::new(test_config()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        session.set_message_handler(Arc::new(move |topic, payload| {
            assert_eq!(topic, "x/y");
            assert_eq!(payload, b"data");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handler = session
            .shared
            .message_handler
            .lock()
            .unwrap()
            .clone()
            .unwrap();
        handler("x/y", b"data");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
