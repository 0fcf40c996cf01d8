//! Connection Manager
//!
//! Keeps one persistent, message-oriented connection alive: heartbeat while
//! connected, bounded exponential backoff after an unexpected loss.
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────► Connecting ──open──► Connected
//!       ▲                          ▲                   │
//!       │ attempts exhausted       │ delay elapsed     │ error / close / failed ping
//!       │                          │                   ▼
//!       └────────────────────── Reconnecting ◄─────────┘
//!
//!  disconnect() from any state ──► Disconnected
//! ```
//!
//! A failed open during reconnection counts as one attempt. The retry
//! counter resets when an open is confirmed and when `connect()` is called
//! by the user; the internal reconnect path never resets it, so the attempt
//! limit always holds.
//!
//! # Concurrency
//!
//! One supervisor task per `connect()` call owns the socket and runs the
//! receive loop, heartbeat and outbound queue from a single `select!`. Every
//! state change from that task is checked against its cancellation token
//! under the manager's lock, so nothing it does can land after
//! `disconnect()` or a newer `connect()`.

mod heartbeat;
mod socket;
#[cfg(feature = "websocket")]
mod websocket;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;

pub use heartbeat::{HeartbeatConfig, ReconnectPolicy};
pub use socket::{Socket, SocketConnector};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Capacity of the outbound message queue
const OUTBOUND_CAPACITY: usize = 32;

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and none being attempted
    Disconnected,
    /// Opening a connection
    Connecting,
    /// Open and healthy
    Connected,
    /// Lost; waiting before the next attempt
    Reconnecting,
}

/// Observable connection events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state changed
    StateChanged(ConnectionState),
    /// An open was confirmed
    Connected,
    /// The connection ended or an open failed
    Disconnected {
        /// What went wrong (`None` for a clean close or `disconnect()`)
        error: Option<String>,
    },
    /// A text message arrived
    Message(String),
    /// A reconnect attempt was scheduled
    ReconnectScheduled {
        /// 1-based attempt number
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
}

struct Outbound {
    text: String,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

enum DriveExit {
    Cancelled,
    Lost(Option<String>),
}

struct Inner {
    connector: Arc<dyn SocketConnector>,
    heartbeat: HeartbeatConfig,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    should_reconnect: AtomicBool,
    retry_count: AtomicU32,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Token of the running supervisor; the lock serializes state changes
    run: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn emit(&self, event: ConnectionEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Caller must hold the `run` lock
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    /// Apply a state change from the supervisor identified by `token`
    fn set_state_for(&self, token: &CancellationToken, state: ConnectionState) -> bool {
        let _run = self.run.lock();
        if token.is_cancelled() {
            return false;
        }
        self.set_state(state);
        true
    }

    fn confirm_open(&self, token: &CancellationToken, outbound: mpsc::Sender<Outbound>) -> bool {
        let _run = self.run.lock();
        if token.is_cancelled() {
            return false;
        }
        self.retry_count.store(0, Ordering::SeqCst);
        *self.outbound.lock() = Some(outbound);
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected);
        info!("Connection established");
        true
    }

    /// Handle a loss; returns the next attempt number, or `None` to stop
    fn schedule_retry(&self, token: &CancellationToken, error: Option<String>) -> Option<(u32, Duration)> {
        let mut run = self.run.lock();
        if token.is_cancelled() {
            return None;
        }
        *self.outbound.lock() = None;
        self.emit(ConnectionEvent::Disconnected {
            error: error.clone(),
        });

        let attempts_made = self.retry_count.load(Ordering::SeqCst);
        if !self.should_reconnect.load(Ordering::SeqCst) || !self.policy.allows(attempts_made) {
            warn!(
                attempts = attempts_made,
                error = error.as_deref().unwrap_or("closed"),
                "Connection lost, giving up"
            );
            self.should_reconnect.store(false, Ordering::SeqCst);
            run.take();
            self.set_state(ConnectionState::Disconnected);
            return None;
        }

        let attempt = attempts_made + 1;
        self.retry_count.store(attempt, Ordering::SeqCst);
        let delay = self.policy.delay_for(attempt);
        warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = error.as_deref().unwrap_or("closed"),
            "Connection lost, scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting);
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
        Some((attempt, delay))
    }
}

/// Persistent connection with heartbeat and reconnection
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager with default heartbeat and reconnect policy
    pub fn new(connector: Arc<dyn SocketConnector>) -> Self {
        Self::with_config(connector, HeartbeatConfig::default(), ReconnectPolicy::default())
    }

    /// Create a manager with explicit settings
    pub fn with_config(
        connector: Arc<dyn SocketConnector>,
        heartbeat: HeartbeatConfig,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                heartbeat,
                policy,
                state,
                should_reconnect: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                subscribers: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                run: Mutex::new(None),
            }),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver that always holds the latest state
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Receive connection events; dropping the receiver unsubscribes
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Reconnect attempts made since the last confirmed open
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// Whether a loss will trigger reconnection
    #[must_use]
    pub fn should_reconnect(&self) -> bool {
        self.inner.should_reconnect.load(Ordering::SeqCst)
    }

    /// Start connecting
    ///
    /// No-op unless `Disconnected` or `Reconnecting`. From `Reconnecting` the
    /// pending attempt is abandoned and a fresh connection starts with the
    /// retry counter at zero. Must be called within a tokio runtime.
    pub fn connect(&self) {
        let inner = &self.inner;
        let mut run = inner.run.lock();
        let current = inner.state();
        if !matches!(
            current,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        ) {
            debug!(state = ?current, "connect() ignored");
            return;
        }
        if let Some(previous) = run.take() {
            previous.cancel();
        }

        inner.retry_count.store(0, Ordering::SeqCst);
        inner.should_reconnect.store(true, Ordering::SeqCst);
        inner.set_state(ConnectionState::Connecting);

        let token = CancellationToken::new();
        *run = Some(token.clone());
        tokio::spawn(supervise(Arc::clone(inner), token));
    }

    /// Close the connection and stop reconnecting
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut run = inner.run.lock();
        inner.should_reconnect.store(false, Ordering::SeqCst);
        let was_running = run.take().map(|token| token.cancel()).is_some();
        *inner.outbound.lock() = None;
        if inner.state() != ConnectionState::Disconnected {
            inner.emit(ConnectionEvent::Disconnected { error: None });
        }
        inner.set_state(ConnectionState::Disconnected);
        if was_running {
            info!("Connection closed by client");
        }
    }

    /// Send a text message
    ///
    /// # Errors
    ///
    /// `NotConnected` unless the state is `Connected`; otherwise whatever the
    /// socket reports.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let sender = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let (reply, result) = oneshot::channel();
        sender
            .send(Outbound {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| TransportError::NotConnected)?;
        result.await.map_err(|_| TransportError::ConnectionClosed)?
    }
}

/// Connect, drive, and reconnect until cancelled or out of attempts
async fn supervise(inner: Arc<Inner>, token: CancellationToken) {
    loop {
        let opened = tokio::select! {
            biased;
            () = token.cancelled() => return,
            opened = inner.connector.connect() => opened,
        };

        let error = match opened {
            Ok(socket) => match drive(&inner, &token, socket).await {
                DriveExit::Cancelled => return,
                DriveExit::Lost(error) => error,
            },
            Err(err) => Some(err.to_string()),
        };

        let Some((_attempt, delay)) = inner.schedule_retry(&token, error) else {
            return;
        };

        tokio::select! {
            biased;
            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        if !inner.set_state_for(&token, ConnectionState::Connecting) {
            return;
        }
    }
}

/// Run one open socket until it fails or the supervisor is cancelled
async fn drive(inner: &Inner, token: &CancellationToken, mut socket: Box<dyn Socket>) -> DriveExit {
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    if !inner.confirm_open(token, tx) {
        socket.close().await;
        return DriveExit::Cancelled;
    }

    let heartbeat_on = inner.heartbeat.enabled && !inner.heartbeat.interval.is_zero();
    let period = inner.heartbeat.interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                socket.close().await;
                return DriveExit::Cancelled;
            }
            received = socket.recv() => match received {
                Ok(Some(text)) => inner.emit(ConnectionEvent::Message(text)),
                Ok(None) => return DriveExit::Lost(None),
                Err(err) => return DriveExit::Lost(Some(err.to_string())),
            },
            Some(outbound) = rx.recv() => {
                let result = socket.send(outbound.text).await;
                let _ = outbound.reply.send(result);
            }
            _ = ticker.tick(), if heartbeat_on => {
                if let Err(err) = socket.ping().await {
                    return DriveExit::Lost(Some(err.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    // =========================================================================
    // Test doubles
    // =========================================================================

    struct MockSocket {
        incoming: mpsc::UnboundedReceiver<String>,
        sent: Arc<Mutex<Vec<String>>>,
        pings: Arc<AtomicUsize>,
        fail_ping: bool,
    }

    #[async_trait]
    impl Socket for MockSocket {
        async fn recv(&mut self) -> Result<Option<String>, TransportError> {
            Ok(self.incoming.recv().await)
        }

        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.fail_ping {
                Err(TransportError::PingFailed("no pong".to_string()))
            } else {
                Ok(())
            }
        }

        async fn close(&mut self) {}
    }

    /// Handle to the peer side of a mock socket
    struct Peer {
        tx: mpsc::UnboundedSender<String>,
        sent: Arc<Mutex<Vec<String>>>,
        pings: Arc<AtomicUsize>,
    }

    fn socket_pair(fail_ping: bool) -> (MockSocket, Peer) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let pings = Arc::new(AtomicUsize::new(0));
        (
            MockSocket {
                incoming,
                sent: Arc::clone(&sent),
                pings: Arc::clone(&pings),
                fail_ping,
            },
            Peer { tx, sent, pings },
        )
    }

    /// Hands out queued sockets; fails once the queue is empty
    #[derive(Default)]
    struct ScriptedConnector {
        sockets: Mutex<VecDeque<MockSocket>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn with_sockets(sockets: Vec<MockSocket>) -> Arc<Self> {
            Arc::new(Self {
                sockets: Mutex::new(sockets.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl SocketConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn Socket>, TransportError> {
            self.attempts.lock().push(Instant::now());
            match self.sockets.lock().pop_front() {
                Some(socket) => Ok(Box::new(socket)),
                None => Err(TransportError::ConnectionFailed("refused".to_string())),
            }
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    async fn wait_for_state(
        rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        wanted: ConnectionState,
    ) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = event == ConnectionEvent::StateChanged(wanted);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    // =========================================================================
    // Backoff
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_then_gives_up() {
        let connector = ScriptedConnector::with_sockets(Vec::new());
        let manager = ConnectionManager::new(connector.clone());
        let mut events = manager.subscribe();

        manager.connect();
        let seen = wait_for_state(&mut events, ConnectionState::Disconnected).await;

        let delays: Vec<u64> = seen
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ReconnectScheduled { delay, .. } => Some(delay.as_secs()),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);

        // Initial open plus five retries, spaced by the backoff delays.
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 6);
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 8, 16]);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.should_reconnect());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_retry_count() {
        let (first, first_peer) = socket_pair(false);
        let (second, _second_peer) = socket_pair(false);
        let connector = ScriptedConnector::with_sockets(vec![first, second]);
        let manager = ConnectionManager::with_config(
            connector.clone(),
            HeartbeatConfig::disabled(),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        manager.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        // Peer closes the first socket.
        drop(first_peer);
        let seen = wait_for_state(&mut events, ConnectionState::Connected).await;
        assert!(seen.contains(&ConnectionEvent::StateChanged(ConnectionState::Reconnecting)));
        assert!(seen.contains(&ConnectionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(connector.attempts().len(), 2);
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive() {
        let (socket, peer) = socket_pair(false);
        let manager = ConnectionManager::with_config(
            ScriptedConnector::with_sockets(vec![socket]),
            HeartbeatConfig::disabled(),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        assert!(matches!(
            manager.send("too early").await,
            Err(TransportError::NotConnected)
        ));

        manager.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        manager.send("hello").await.unwrap();
        assert_eq!(peer.sent.lock().clone(), vec!["hello".to_string()]);

        peer.tx.send("from peer".to_string()).unwrap();
        loop {
            if let ConnectionEvent::Message(text) = next_event(&mut events).await {
                assert_eq!(text, "from peer");
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_when_connected() {
        let (socket, _peer) = socket_pair(false);
        let connector = ScriptedConnector::with_sockets(vec![socket]);
        let manager = ConnectionManager::with_config(
            connector.clone(),
            HeartbeatConfig::disabled(),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        manager.connect();
        manager.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        manager.connect();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_everything() {
        let (socket, _peer) = socket_pair(false);
        let connector = ScriptedConnector::with_sockets(vec![socket]);
        let manager = ConnectionManager::with_config(
            connector.clone(),
            HeartbeatConfig::disabled(),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        manager.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        manager.disconnect();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.should_reconnect());
        assert!(matches!(
            manager.send("late").await,
            Err(TransportError::NotConnected)
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_on_interval() {
        let (socket, peer) = socket_pair(false);
        let manager = ConnectionManager::with_config(
            ScriptedConnector::with_sockets(vec![socket]),
            HeartbeatConfig::new().with_interval(Duration::from_secs(30)),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        manager.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(peer.pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_triggers_reconnect() {
        let (failing, _failing_peer) = socket_pair(true);
        let (healthy, _healthy_peer) = socket_pair(false);
        let manager = ConnectionManager::with_config(
            ScriptedConnector::with_sockets(vec![failing, healthy]),
            HeartbeatConfig::new().with_interval(Duration::from_secs(30)),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        manager.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;

        let seen = wait_for_state(&mut events, ConnectionState::Reconnecting).await;
        assert!(seen.iter().any(|e| matches!(
            e,
            ConnectionEvent::Disconnected { error: Some(msg) } if msg.contains("no pong")
        )));
        wait_for_state(&mut events, ConnectionState::Connected).await;
    }
}
