//! Duplex message channel with automatic reconnect.
//!
//! The same [`Transport`] drives the dashboard-wide channel and every
//! per-terminal channel.  It only frames and deframes text and keeps the
//! physical link alive; what the frames mean is up to its subscribers.
//!
//! State machine:
//!
//! ```text
//! disconnected → connecting → connected
//! connected → reconnecting → connected | failed
//! (any) --reconnect()--> connecting
//! ```
//!
//! Every transition and every frame is published to subscribers, in order,
//! while the transport's state lock is held, so no subscriber ever observes a
//! stale driver's events after a `disconnect()` or `reconnect()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::model::PresenceInfo;
use crate::presence::Roster;
use crate::protocol::frame_type;

// ── Public types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    State {
        from: ConnectionState,
        to: ConnectionState,
        error: Option<TransportError>,
    },
    Frame(String),
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff capped at `max_delay`, plus up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// One open physical link.  Dropping `outgoing` closes the link from our
/// side; `incoming` yielding `None` means the peer went away.
pub struct Link {
    pub outgoing: UnboundedSender<String>,
    pub incoming: UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

/// WebSocket connector.  Text frames only; binary and ping frames are ignored.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })?;

        let (mut sink, mut stream) = ws.split();

        // Outgoing: caller → writer task → WS sink
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(json) = send_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Incoming: WS stream → reader task → caller
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if frame_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Link {
            outgoing: send_tx,
            incoming: frame_rx,
        })
    }
}

// ── Transport ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    inner: Mutex<Inner>,
    subscribers: Mutex<HashMap<u64, UnboundedSender<ChannelEvent>>>,
    next_subscriber: AtomicU64,
    roster: Mutex<Roster>,
}

struct Inner {
    url: String,
    state: ConnectionState,
    outgoing: Option<UnboundedSender<String>>,
    driver: Option<JoinHandle<()>>,
    // Bumped by every connect/reconnect/disconnect; a driver whose generation
    // is stale may not touch state or publish anything.
    generation: u64,
    last_error: Option<TransportError>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                connector,
                policy,
                inner: Mutex::new(Inner {
                    url: url.into(),
                    state: ConnectionState::Disconnected,
                    outgoing: None,
                    driver: None,
                    generation: 0,
                    last_error: None,
                }),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                roster: Mutex::new(Roster::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    pub fn url(&self) -> String {
        lock(&self.shared.inner).url.clone()
    }

    pub fn last_error(&self) -> Option<TransportError> {
        lock(&self.shared.inner).last_error.clone()
    }

    /// Open the channel.  No-op while a driver is already connecting,
    /// connected, or reconnecting.  Must be called inside a tokio runtime.
    pub fn connect(&self) {
        {
            let inner = lock(&self.shared.inner);
            let running = inner.driver.as_ref().is_some_and(|d| !d.is_finished());
            if running
                && matches!(
                    inner.state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Reconnecting
                )
            {
                return;
            }
        }
        self.start();
    }

    /// Drop whatever is in flight (including a backoff timer) and start over
    /// from `connecting` with a fresh retry budget.  Allowed from any state.
    pub fn reconnect(&self) {
        info!(channel = %self.shared.name, "manual reconnect");
        self.start();
    }

    /// Point the channel at a new endpoint and reconnect to it.
    pub fn rebind(&self, url: impl Into<String>) {
        let url = url.into();
        info!(channel = %self.shared.name, %url, "rebinding channel");
        lock(&self.shared.inner).url = url;
        self.start();
    }

    /// Close the channel and cancel any pending reconnect.
    pub fn disconnect(&self) {
        let mut inner = lock(&self.shared.inner);
        inner.generation += 1;
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
        inner.outgoing = None;
        lock(&self.shared.roster).clear();
        self.shared
            .transition_locked(&mut inner, ConnectionState::Disconnected, None);
    }

    /// Serialize and transmit `frame`.  Returns whether transmission was
    /// attempted: `false` when not connected.
    pub fn send<T: Serialize>(&self, frame: &T) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(channel = %self.shared.name, error = %e, "failed to encode outgoing frame");
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        let inner = lock(&self.shared.inner);
        if inner.state != ConnectionState::Connected {
            debug!(channel = %self.shared.name, state = %inner.state, "send skipped, not connected");
            return false;
        }
        match &inner.outgoing {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Register for state and frame events.  The returned [`Subscription`]
    /// unsubscribes on drop.
    pub fn subscribe(&self) -> (Subscription, UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).insert(id, tx);
        (
            Subscription {
                shared: Arc::downgrade(&self.shared),
                id,
                active: true,
            },
            rx,
        )
    }

    /// Current presence roster, built from join/leave/cursor/select/presence frames.
    pub fn roster(&self) -> Vec<PresenceInfo> {
        lock(&self.shared.roster).snapshot()
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    fn start(&self) {
        let mut inner = lock(&self.shared.inner);
        inner.generation += 1;
        let generation = inner.generation;
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
        inner.outgoing = None;
        self.shared
            .transition_locked(&mut inner, ConnectionState::Connecting, None);
        let shared = Arc::clone(&self.shared);
        inner.driver = Some(tokio::spawn(drive(shared, generation)));
    }
}

impl Shared {
    fn transition_locked(
        &self,
        inner: &mut Inner,
        to: ConnectionState,
        error: Option<TransportError>,
    ) {
        let from = inner.state;
        if let Some(err) = &error {
            inner.last_error = Some(err.clone());
        } else if to == ConnectionState::Connected {
            inner.last_error = None;
        }
        if from == to {
            return;
        }
        inner.state = to;
        debug!(channel = %self.name, %from, %to, "connection state changed");
        self.publish(ChannelEvent::State { from, to, error });
    }

    /// Transition only if `generation` still owns the channel.
    fn transition(
        &self,
        generation: u64,
        to: ConnectionState,
        error: Option<TransportError>,
    ) -> bool {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        self.transition_locked(&mut inner, to, error);
        true
    }

    fn attach(&self, generation: u64, outgoing: UnboundedSender<String>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        inner.outgoing = Some(outgoing);
        self.transition_locked(&mut inner, ConnectionState::Connected, None);
        true
    }

    fn lose_link(&self, generation: u64, reason: String) -> bool {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        inner.outgoing = None;
        lock(&self.roster).clear();
        self.transition_locked(
            &mut inner,
            ConnectionState::Reconnecting,
            Some(TransportError::Closed(reason)),
        );
        true
    }

    fn record_failure(&self, generation: u64, error: TransportError) -> bool {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        lock(&self.roster).clear();
        if inner.state == ConnectionState::Reconnecting {
            inner.last_error = Some(error);
        } else {
            self.transition_locked(&mut inner, ConnectionState::Reconnecting, Some(error));
        }
        true
    }

    fn dispatch_frame(&self, generation: u64, text: String) -> bool {
        let inner = lock(&self.inner);
        if inner.generation != generation {
            return false;
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => {
                trace!(channel = %self.name, kind = frame_type(&value).unwrap_or("?"), "frame received");
                lock(&self.roster).observe(&value);
            }
            Err(_) => trace!(channel = %self.name, "non-JSON frame received"),
        }
        self.publish(ChannelEvent::Frame(text));
        drop(inner);
        true
    }

    fn publish(&self, event: ChannelEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

async fn drive(shared: Arc<Shared>, generation: u64) {
    let mut attempt: u32 = 0;
    loop {
        let url = lock(&shared.inner).url.clone();
        match shared.connector.open(&url).await {
            Ok(link) => {
                attempt = 0;
                let Link {
                    outgoing,
                    mut incoming,
                } = link;
                if !shared.attach(generation, outgoing) {
                    return;
                }
                info!(channel = %shared.name, %url, "channel connected");
                while let Some(text) = incoming.recv().await {
                    if !shared.dispatch_frame(generation, text) {
                        return;
                    }
                }
                warn!(channel = %shared.name, "channel closed unexpectedly");
                if !shared.lose_link(generation, "connection lost".to_string()) {
                    return;
                }
            }
            Err(error) => {
                warn!(channel = %shared.name, error = %error, "connect attempt failed");
                if !shared.record_failure(generation, error) {
                    return;
                }
            }
        }

        attempt += 1;
        if attempt > shared.policy.max_retries {
            warn!(channel = %shared.name, attempts = attempt - 1, "reconnect attempts exhausted");
            shared.transition(
                generation,
                ConnectionState::Failed,
                Some(TransportError::RetriesExhausted {
                    attempts: attempt - 1,
                }),
            );
            return;
        }
        let delay = shared.policy.delay_for(attempt - 1);
        debug!(channel = %shared.name, attempt, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::time::sleep(delay).await;
    }
}

// ── Subscription ──────────────────────────────────────────────────────────

/// Handle for one subscriber.  `unsubscribe` is idempotent and never fails,
/// even after the transport itself is gone.
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let Some(shared) = self.shared.upgrade() else {
            debug!(id = self.id, "transport already torn down, nothing to unsubscribe");
            return;
        };
        match shared.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.remove(&self.id);
            }
            Err(poisoned) => {
                warn!(channel = %shared.name, id = self.id, "subscriber registry poisoned during unsubscribe");
                poisoned.into_inner().remove(&self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ── Test support ──────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    fn transport(connector: Arc<FakeConnector>, retries: u32) -> Transport {
        Transport::new("test", "ws://fake/ws", connector, fast_policy(retries))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));
        let third = policy.delay_for(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(480));
        let capped = policy.delay_for(30);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_send_and_receive() {
        let (connector, mut servers) = FakeConnector::new();
        let transport = transport(connector, 3);
        let (_sub, mut events) = transport.subscribe();

        assert!(!transport.send(&json!({"type": "ping"})));

        transport.connect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

        let mut server = servers.recv().await.unwrap();
        assert!(transport.send(&json!({"type": "ping"})));
        assert_eq!(server.from_client.recv().await.unwrap(), r#"{"type":"ping"}"#);

        server.push(json!({"type": "output", "data": "hi"}));
        match events.recv().await.unwrap() {
            ChannelEvent::Frame(text) => assert!(text.contains("\"hi\"")),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_noop_while_running() {
        let (connector, _servers) = FakeConnector::new();
        let transport = transport(connector.clone(), 3);
        let (_sub, mut events) = transport.subscribe();
        transport.connect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        transport.connect();
        tokio::task::yield_now().await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_triggers_reconnect() {
        let (connector, mut servers) = FakeConnector::new();
        let transport = transport(connector.clone(), 3);
        let (_sub, mut events) = transport.subscribe();
        transport.connect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

        drop(servers.recv().await.unwrap());
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);
        assert!(matches!(transport.last_error(), Some(TransportError::Closed(_))));
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert_eq!(connector.attempts(), 2);
        assert!(transport.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_then_manual_reconnect_recovers() {
        let (connector, _servers) = FakeConnector::new();
        connector.fail_next(3);
        let transport = transport(connector.clone(), 2);
        let (_sub, mut events) = transport.subscribe();

        transport.connect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Failed);
        assert_eq!(connector.attempts(), 3);
        assert!(matches!(
            transport.last_error(),
            Some(TransportError::RetriesExhausted { attempts: 2 })
        ));

        transport.reconnect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_backoff() {
        let (connector, _servers) = FakeConnector::new();
        connector.fail_next(10);
        let transport = transport(connector.clone(), 5);
        let (_sub, mut events) = transport.subscribe();

        transport.connect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);
        transport.disconnect();
        assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);

        let attempts = connector.attempts();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), attempts);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn rebind_targets_new_url() {
        let (connector, mut servers) = FakeConnector::new();
        let transport = transport(connector, 3);
        transport.connect();
        assert_eq!(servers.recv().await.unwrap().url, "ws://fake/ws");
        transport.rebind("ws://fake/other");
        assert_eq!(servers.recv().await.unwrap().url, "ws://fake/other");
        assert_eq!(transport.url(), "ws://fake/other");
    }

    #[tokio::test(start_paused = true)]
    async fn roster_follows_presence_frames() {
        let (connector, mut servers) = FakeConnector::new();
        let transport = transport(connector, 3);
        let (_sub, mut events) = transport.subscribe();
        transport.connect();
        let server = servers.recv().await.unwrap();
        server.push(json!({"type": "join", "user": {"user_id": "u1", "user_name": "Ada"}}));
        server.push(json!({"type": "join", "user": {"user_id": "u2", "user_name": "Bob"}}));
        server.push(json!({"type": "leave", "user_id": "u1"}));

        let mut frames = 0;
        while frames < 3 {
            if let Some(ChannelEvent::Frame(_)) = events.recv().await {
                frames += 1;
            }
        }
        let roster = transport.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn roster_is_emptied_when_link_drops() {
        let (connector, mut servers) = FakeConnector::new();
        let transport = transport(connector.clone(), 3);
        let (_sub, mut events) = transport.subscribe();
        transport.connect();
        let server = servers.recv().await.unwrap();
        server.push(json!({"type": "join", "user": {"user_id": "ghost", "user_name": "Gus"}}));
        loop {
            if let Some(ChannelEvent::Frame(_)) = events.recv().await {
                break;
            }
        }
        assert_eq!(transport.roster().len(), 1);

        connector.fail_next(1);
        drop(server);
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);
        assert!(transport.roster().is_empty());

        // The replacement link starts with an empty roster until the server re-announces.
        let _server = servers.recv().await.unwrap();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert!(transport.roster().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_safe_after_teardown() {
        let (connector, _servers) = FakeConnector::new();
        let transport = transport(connector, 3);
        let (mut sub, _events) = transport.subscribe();
        assert_eq!(transport.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(transport.subscriber_count(), 0);

        let (mut orphan, _rx) = transport.subscribe();
        drop(transport);
        orphan.unsubscribe();
        orphan.unsubscribe();
    }
}
