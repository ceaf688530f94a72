//! Persistent stream with reconnect and subscription replay
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!                                   \             /
//!                                    `-> Closed <-'
//! ```
//!
//! A background driver task owns the live session. It routes inbound frames into
//! subscription queues, answers pings, sends heartbeats, and on any unexpected drop
//! reconnects with capped exponential backoff before replaying the registry. Consumers
//! never re-subscribe themselves, and only see an error when reconnecting gives up.

use super::{
    codec::{Inbound, JsonCodec, StreamCodec},
    subscription::{Registry, Sink, Subscription, SubscriptionId},
    transport::{Connector, Frame, StreamSession},
};
use crate::{
    backoff::Backoff,
    callbacks::{ListenerId, Listeners},
    errors::ConnectionError,
    instrumentation::Instrumentation,
    queue::{BoundedQueue, Push},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected yet, or the first handshake failed
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications emitted to connection listeners
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A reconnect attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Back online after `attempts` tries, with `resubscribed` wire subscriptions replayed
    Reconnected { attempts: u32, resubscribed: usize },
    Error(ConnectionError),
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::StateChange { .. } => "state_change",
            ConnectionEvent::Reconnecting { .. } => "reconnecting",
            ConnectionEvent::Reconnected { .. } => "reconnected",
            ConnectionEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Handshake deadline for connect and every reconnect attempt
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    /// Force a reconnect when nothing arrives for this long
    pub idle_timeout_ms: Option<u64>,
    /// Per-subscription buffer; the oldest payload is dropped beyond it
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: None,
            heartbeat_interval_ms: Some(30_000),
            idle_timeout_ms: None,
            queue_capacity: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(self.reconnect_delay_ms, self.max_reconnect_delay_ms)
    }
}

pub(crate) enum Command {
    Send(Frame),
    Disconnect,
}

pub(crate) struct Shared {
    name: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn StreamCodec>,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    listeners: Listeners<ConnectionEvent>,
    instrumentation: Option<Arc<Instrumentation>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `to` if `allowed(current)` holds. `Closed` is never left.
    fn set_state(&self, to: ConnectionState, allowed: impl FnOnce(ConnectionState) -> bool) -> bool {
        let mut from = to;
        let changed = self.state.send_if_modified(|current| {
            if *current == to || *current == ConnectionState::Closed || !allowed(*current) {
                return false;
            }
            from = std::mem::replace(current, to);
            true
        });

        if changed {
            debug!(connection = %self.name, %from, %to, "state change");
            self.emit(ConnectionEvent::StateChange { from, to });
        }
        changed
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(instrumentation) = &self.instrumentation {
            instrumentation.connection_event(&self.name, &event);
        }
        self.listeners.emit(&event);
    }

    fn register(&self, channel: String, params: Value, sink: Sink) -> Result<SubscriptionId, ConnectionError> {
        let mut registry = self.registry();
        if registry.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let frame = self.codec.subscribe_frame(&channel, &params);
        let (id, first) = registry.insert(channel, params, sink);
        if first && let Some(outbox) = &registry.outbox {
            let _ = outbox.send(Command::Send(frame));
        }
        debug!(connection = %self.name, subscription = %id, "subscribed");
        Ok(id)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let entry = {
            let mut registry = self.registry();
            let Some((entry, last)) = registry.remove(id) else {
                return false;
            };
            if last && let Some(outbox) = &registry.outbox {
                let frame = self.codec.unsubscribe_frame(&entry.channel, &entry.params);
                let _ = outbox.send(Command::Send(frame));
            }
            entry
        };

        entry.sink.close();
        debug!(connection = %self.name, subscription = %id, channel = %entry.channel, "unsubscribed");
        true
    }

    fn deliver(&self, inbound: &Inbound) {
        let targets = self.registry().route(self.codec.as_ref(), inbound);
        for (channel, sink) in targets {
            match sink {
                Sink::Queue(queue) => {
                    if let Push::Evicted(_) = queue.push(inbound.payload.clone()) {
                        debug!(connection = %self.name, %channel, "slow consumer, oldest payload dropped");
                        if let Some(instrumentation) = &self.instrumentation {
                            instrumentation.queue_evicted(&self.name, &channel);
                        }
                    }
                }
                Sink::Callback { on_data, .. } => on_data(inbound.payload.clone()),
            }
        }
    }

    async fn handle_frame(&self, session: &mut dyn StreamSession, frame: Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::Ping(payload) => session.send(Frame::Pong(payload)).await,
            Frame::Pong(_) => Ok(()),
            frame => {
                match self.codec.decode(&frame) {
                    Ok(Some(inbound)) => self.deliver(&inbound),
                    Ok(None) => {}
                    Err(error) => {
                        debug!(connection = %self.name, %error, "undecodable frame skipped");
                        self.emit(ConnectionEvent::Error(error));
                    }
                }
                Ok(())
            }
        }
    }

    /// Drop commands aimed at the dead session, then replay the registry.
    ///
    /// `Ok(None)` when a disconnect was requested in the meantime.
    async fn resume(
        &self,
        session: &mut dyn StreamSession,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Option<usize>, ConnectionError> {
        let replay = {
            let registry = self.registry();
            while let Ok(command) = commands.try_recv() {
                if let Command::Disconnect = command {
                    return Ok(None);
                }
            }
            registry.replay_set()
        };

        send_replay(self.codec.as_ref(), session, &replay).await?;
        Ok(Some(replay.len()))
    }

    /// End every subscription, with `error` if given, and stop accepting new ones.
    fn shutdown(&self, error: Option<&ConnectionError>) {
        let entries = {
            let mut registry = self.registry();
            if let Some(outbox) = registry.outbox.take() {
                let _ = outbox.send(Command::Disconnect);
            }
            registry.drain()
        };

        for entry in entries {
            match error {
                Some(error) => entry.sink.fail(error),
                None => entry.sink.close(),
            }
        }
    }

    fn exhaust(&self, attempts: u32) {
        let error = ConnectionError::ReconnectExhausted { attempts };
        error!(connection = %self.name, attempts, "reconnect attempts exhausted, closing");
        self.set_state(ConnectionState::Closed, |_| true);
        self.emit(ConnectionEvent::Error(error.clone()));
        self.shutdown(Some(&error));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in registry.drain() {
            entry.sink.close();
        }
    }
}

/// Handle to one persistent logical stream, shared by all of its subscriptions.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Manager with default config and the [`JsonCodec`] envelope.
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::builder(name, connector).build()
    }

    pub fn builder(name: impl Into<String>, connector: Arc<dyn Connector>) -> ConnectionBuilder {
        ConnectionBuilder::new(name, connector)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.shared.registry().contains(id)
    }

    /// Open the stream and replay anything subscribed beforehand.
    ///
    /// Fails with [`ConnectionError::HandshakeTimeout`] when the handshake exceeds
    /// `connect_timeout_ms`, leaving the manager `Disconnected` so it can be retried.
    /// Calling it while already connecting or connected is a no-op.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        if !shared.set_state(ConnectionState::Connecting, |from| {
            from == ConnectionState::Disconnected
        }) {
            return match shared.state() {
                ConnectionState::Closed => Err(ConnectionError::Closed),
                _ => Ok(()),
            };
        }

        let timeout = shared.config.connect_timeout();
        let handshake = match tokio::time::timeout(timeout, shared.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout(timeout)),
        };
        let mut session = match handshake {
            Ok(session) => session,
            Err(error) => {
                warn!(connection = %shared.name, %error, "handshake failed");
                shared.emit(ConnectionEvent::Error(error.clone()));
                shared.set_state(ConnectionState::Disconnected, |from| {
                    from == ConnectionState::Connecting
                });
                return Err(error);
            }
        };

        let (outbox, commands) = mpsc::unbounded_channel();
        let replay = {
            let mut registry = shared.registry();
            if registry.is_closed() {
                None
            } else {
                registry.outbox = Some(outbox);
                Some(registry.replay_set())
            }
        };
        let Some(replay) = replay else {
            session.close().await;
            return Err(ConnectionError::Closed);
        };

        if let Err(error) = send_replay(shared.codec.as_ref(), session.as_mut(), &replay).await {
            warn!(connection = %shared.name, %error, "initial subscribe failed");
            shared.registry().outbox = None;
            session.close().await;
            shared.emit(ConnectionEvent::Error(error.clone()));
            shared.set_state(ConnectionState::Disconnected, |from| {
                from == ConnectionState::Connecting
            });
            return Err(error);
        }

        shared.set_state(ConnectionState::Connected, |from| {
            from == ConnectionState::Connecting
        });
        info!(connection = %shared.name, subscriptions = replay.len(), "connected");

        let driver = tokio::spawn(drive(Arc::downgrade(shared), session, commands));
        *shared.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);
        Ok(())
    }

    /// Close for good. Subscriptions end without error after draining their backlog.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        if !shared.set_state(ConnectionState::Closed, |_| true) {
            return;
        }
        shared.shutdown(None);

        let driver = shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        info!(connection = %shared.name, "disconnected");
    }

    /// Register interest in `channel` with `params` as a filter (`Value::Null` for all).
    ///
    /// The registration is replayed after every reconnect until the returned handle is
    /// dropped or [`unsubscribe`](Self::unsubscribe)d.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        params: Value,
    ) -> Result<Subscription, ConnectionError> {
        let channel = channel.into();
        let queue = Arc::new(BoundedQueue::new(self.shared.config.queue_capacity.max(1)));
        let id = self.shared.register(
            channel.clone(),
            params.clone(),
            Sink::Queue(Arc::clone(&queue)),
        )?;
        Ok(Subscription::new(
            id,
            channel,
            params,
            queue,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Callback flavour of [`subscribe`](Self::subscribe). `on_error` runs once, when
    /// reconnecting gives up.
    pub fn subscribe_with<D, F>(
        &self,
        channel: impl Into<String>,
        params: Value,
        on_data: D,
        on_error: F,
    ) -> Result<SubscriptionId, ConnectionError>
    where
        D: Fn(Value) + Send + Sync + 'static,
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.shared.register(
            channel.into(),
            params,
            Sink::Callback {
                on_data: Arc::new(on_data),
                on_error: Arc::new(on_error),
            },
        )
    }

    /// Remove from the live registry and the replay set. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.unsubscribe(id)
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unsubscribe(id)
    }

    pub fn destroy_listeners(&self) {
        self.shared.listeners.destroy();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

pub struct ConnectionBuilder {
    name: String,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    codec: Arc<dyn StreamCodec>,
    instrumentation: Option<Arc<Instrumentation>>,
    listeners: Listeners<ConnectionEvent>,
}

impl ConnectionBuilder {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            connector,
            config: ConnectionConfig::default(),
            codec: Arc::new(JsonCodec),
            instrumentation: None,
            listeners: Listeners::new(),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn StreamCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    pub fn on_event<F>(self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener);
        self
    }

    pub fn build(self) -> ConnectionManager {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            shared: Arc::new(Shared {
                name: self.name,
                config: self.config,
                connector: self.connector,
                codec: self.codec,
                registry: Mutex::new(Registry::default()),
                state,
                listeners: self.listeners,
                instrumentation: self.instrumentation,
                driver: Mutex::new(None),
            }),
        }
    }
}

enum Wake {
    Inbound(Option<Result<Frame, ConnectionError>>),
    Command(Option<Command>),
    Heartbeat,
    Idle,
}

enum SessionEnd {
    Disconnect,
    Dropped(ConnectionError),
    /// Every manager handle is gone
    Orphaned,
}

async fn drive(
    shared: Weak<Shared>,
    mut session: Box<dyn StreamSession>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let end = run_session(&shared, session.as_mut(), &mut commands).await;
        session.close().await;

        let cause = match end {
            SessionEnd::Dropped(cause) => cause,
            SessionEnd::Disconnect | SessionEnd::Orphaned => return,
        };
        match reconnect(&shared, &mut commands, cause).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

async fn run_session(
    weak: &Weak<Shared>,
    session: &mut dyn StreamSession,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let Some((heartbeat, idle_timeout)) = weak
        .upgrade()
        .map(|shared| (shared.config.heartbeat_interval(), shared.config.idle_timeout()))
    else {
        return SessionEnd::Orphaned;
    };

    let mut heartbeat = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut idle_deadline = idle_timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let wake = tokio::select! {
            frame = session.recv() => Wake::Inbound(frame),
            command = commands.recv() => Wake::Command(command),
            _ = next_tick(&mut heartbeat) => Wake::Heartbeat,
            _ = idle_expiry(idle_deadline) => Wake::Idle,
        };
        let Some(shared) = weak.upgrade() else {
            return SessionEnd::Orphaned;
        };

        let outcome = match wake {
            Wake::Inbound(None) => {
                return SessionEnd::Dropped(ConnectionError::Transport(
                    "stream closed by peer".to_owned(),
                ));
            }
            Wake::Inbound(Some(Err(error))) => return SessionEnd::Dropped(error),
            Wake::Inbound(Some(Ok(frame))) => {
                if let Some(timeout) = idle_timeout {
                    idle_deadline = Some(Instant::now() + timeout);
                }
                shared.handle_frame(session, frame).await
            }
            Wake::Command(None | Some(Command::Disconnect)) => return SessionEnd::Disconnect,
            Wake::Command(Some(Command::Send(frame))) => session.send(frame).await,
            Wake::Heartbeat => session.send(Frame::Ping(Vec::new())).await,
            Wake::Idle => Err(ConnectionError::IdleTimeout(
                idle_timeout.unwrap_or_default(),
            )),
        };

        if let Err(error) = outcome {
            return SessionEnd::Dropped(error);
        }
    }
}

/// Reconnect loop. `None` when the manager closed, was dropped, or gave up.
async fn reconnect(
    weak: &Weak<Shared>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    cause: ConnectionError,
) -> Option<Box<dyn StreamSession>> {
    let (backoff, max_attempts, connect_timeout, connector) = {
        let shared = weak.upgrade()?;
        if !shared.set_state(ConnectionState::Reconnecting, |from| {
            from == ConnectionState::Connected
        }) {
            return None;
        }
        warn!(connection = %shared.name, error = %cause, "connection lost, reconnecting");
        shared.emit(ConnectionEvent::Error(cause));
        (
            shared.config.backoff(),
            shared.config.max_reconnect_attempts,
            shared.config.connect_timeout(),
            Arc::clone(&shared.connector),
        )
    };

    let mut attempt: u32 = 0;
    loop {
        if max_attempts.is_some_and(|max| attempt >= max) {
            if let Some(shared) = weak.upgrade() {
                shared.exhaust(attempt);
            }
            return None;
        }
        attempt += 1;

        let delay = backoff.delay(attempt);
        {
            let shared = weak.upgrade()?;
            debug!(
                connection = %shared.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            shared.emit(ConnectionEvent::Reconnecting { attempt, delay });
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = disconnect_requested(commands) => return None,
        }

        let handshake = match tokio::time::timeout(connect_timeout, connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout(connect_timeout)),
        };
        let shared = weak.upgrade()?;
        let mut session = match handshake {
            Ok(session) => session,
            Err(error) => {
                warn!(connection = %shared.name, attempt, %error, "reconnect attempt failed");
                shared.emit(ConnectionEvent::Error(error));
                continue;
            }
        };

        match shared.resume(session.as_mut(), commands).await {
            Ok(Some(resubscribed)) => {
                if !shared.set_state(ConnectionState::Connected, |from| {
                    from == ConnectionState::Reconnecting
                }) {
                    session.close().await;
                    return None;
                }
                info!(connection = %shared.name, attempts = attempt, resubscribed, "reconnected");
                shared.emit(ConnectionEvent::Reconnected {
                    attempts: attempt,
                    resubscribed,
                });
                return Some(session);
            }
            Ok(None) => {
                session.close().await;
                return None;
            }
            Err(error) => {
                warn!(connection = %shared.name, attempt, %error, "resubscribe failed");
                shared.emit(ConnectionEvent::Error(error));
                session.close().await;
            }
        }
    }
}

async fn send_replay(
    codec: &dyn StreamCodec,
    session: &mut dyn StreamSession,
    replay: &[(String, Value)],
) -> Result<(), ConnectionError> {
    for (channel, params) in replay {
        session.send(codec.subscribe_frame(channel, params)).await?;
    }
    Ok(())
}

/// Resolves on a disconnect request, discarding sends meant for the dead session.
async fn disconnect_requested(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Send(_)) => continue,
            Some(Command::Disconnect) | None => return,
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn idle_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<Box<dyn StreamSession>, ConnectionError> {
            pending().await
        }
    }

    struct Refused;

    #[async_trait]
    impl Connector for Refused {
        async fn connect(&self) -> Result<Box<dyn StreamSession>, ConnectionError> {
            Err(ConnectionError::Handshake("401 unauthorized".into()))
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.backoff().delay(6), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_and_stays_retryable() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let manager = ConnectionManager::builder("okx-public", Arc::new(Unreachable))
            .config(ConnectionConfig {
                connect_timeout_ms: 2_000,
                ..ConnectionConfig::default()
            })
            .on_event(move |event| seen.lock().unwrap().push(event.clone()))
            .build();

        let error = manager.connect().await.unwrap_err();
        assert_eq!(error, ConnectionError::HandshakeTimeout(Duration::from_secs(2)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            ConnectionEvent::StateChange {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connecting,
            }
        );
        assert_eq!(events[1], ConnectionEvent::Error(error.clone()));
        assert_eq!(
            events[2],
            ConnectionEvent::StateChange {
                from: ConnectionState::Connecting,
                to: ConnectionState::Disconnected,
            }
        );
    }

    #[tokio::test]
    async fn test_handshake_failure_is_reported() {
        let manager = ConnectionManager::new("kraken-private", Arc::new(Refused));
        let subscription = manager.subscribe("balances", Value::Null).unwrap();

        assert_eq!(
            manager.connect().await,
            Err(ConnectionError::Handshake("401 unauthorized".into()))
        );
        assert!(manager.is_subscribed(subscription.id()));
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_work() {
        let manager = ConnectionManager::new("bybit", Arc::new(Refused));
        let mut subscription = manager.subscribe("tickers", Value::Null).unwrap();

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(subscription.recv().await, None);
        assert_eq!(manager.connect().await, Err(ConnectionError::Closed));
        assert!(matches!(
            manager.subscribe("tickers", Value::Null),
            Err(ConnectionError::Closed)
        ));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_before_connect() {
        let manager = ConnectionManager::new("coinbase", Arc::new(Refused));
        let id = manager
            .subscribe_with("level2", Value::Null, |_| {}, |_| {})
            .unwrap();

        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        assert_eq!(manager.subscription_count(), 0);
    }
}
