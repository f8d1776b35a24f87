//! Connection lifecycle: one live transport at a time, reconnect on failure.
//!
//! [`ConnectionManager`] owns a background task that opens a transport through
//! a [`Connector`], pumps outbound [`ClientMessage`]s into it, decodes inbound
//! [`ServerMessage`]s and fans them out to registered listeners. When the
//! transport closes or errors, the task enters a retry loop that keeps trying
//! to open a fresh transport until one succeeds or the manager is shut down.
//!
//! ```text
//! Idle ──start──▶ Connecting ──ok──▶ Open ──close/error──▶ Closed(Retrying)
//!                     │                                        │   ▲
//!                     └──fail/timeout──────────────────────────┘   │
//!                                        tick ─▶ Connecting ─fail──┘
//! any ──shutdown / retries exhausted──▶ Closed(Final)
//! ```
//!
//! The cheap, cloneable [`ConnectionHandle`] is what other components hold:
//! it sends messages, manages listeners and observes [`ConnectionState`].
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::start(
//!     WebSocketConnector::new("ws://127.0.0.1:7776"),
//!     ConnectionConfig::new(),
//! );
//! let connection = manager.handle();
//!
//! let on_log = listener(|msg| println!("{msg:?}"));
//! connection.add_listener(MessageKind::Log, on_log.clone());
//! connection.send(ClientMessage::SetName { data: "Alice".into() });
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{CounterSyncError, Result};
use crate::listeners::{Listener, ListenerRegistry};
use crate::protocol::{ClientMessage, MessageKind, ServerMessage};
use crate::transport::{Connector, Transport};

/// Default cadence of the reconnect loop.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Default minimum spacing between two reconnect attempts.
pub const DEFAULT_ATTEMPT_WINDOW: Duration = Duration::from_millis(500);

/// Default time a single connect attempt may take before it is abandoned.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`].
///
/// # Example
///
/// ```
/// use counter_sync::connection::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::new()
///     .with_attempt_timeout(Duration::from_secs(2))
///     .with_max_retries(10);
/// assert_eq!(config.retry_interval, Duration::from_millis(1000));
/// assert_eq!(config.max_retries, Some(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How often the retry loop fires while disconnected.
    ///
    /// Defaults to **1000 ms**.
    pub retry_interval: Duration,
    /// Minimum time between the starts of two connect attempts, across
    /// reconnect episodes. A retry tick that lands inside this window is
    /// skipped.
    ///
    /// Defaults to **500 ms**.
    pub attempt_window: Duration,
    /// Upper bound for one connect attempt. An attempt that neither opens nor
    /// fails within this time is abandoned and its transport discarded.
    /// Applies to the initial connect as well.
    ///
    /// Defaults to **500 ms**.
    pub attempt_timeout: Duration,
    /// Give up after this many consecutive failed reconnect attempts and move
    /// to `Closed(Final)`. `None` retries forever.
    ///
    /// Defaults to `None`.
    pub max_retries: Option<u32>,
    /// Time the background task is given to close the transport when
    /// [`ConnectionManager::shutdown`] is called before it is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a configuration with the default timings.
    pub fn new() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            attempt_window: DEFAULT_ATTEMPT_WINDOW,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_retries: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the reconnect cadence. Zero is clamped to 1 ms.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the minimum spacing between reconnect attempts.
    #[must_use]
    pub fn with_attempt_window(mut self, window: Duration) -> Self {
        self.attempt_window = window;
        self
    }

    /// Set the timeout of a single connect attempt.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Stop reconnecting after `max_retries` consecutive failures.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Why the connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The retry loop is running.
    Retrying,
    /// Torn down; no further attempts will be made.
    Final,
}

/// Lifecycle position of the [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Closed(CloseKind),
}

/// Observable connection state published by the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Set when a connection failed and no attempt has succeeded since.
    /// This is the flag a UI turns into a "disconnected" banner.
    pub disconnected: bool,
    /// Consecutive failed reconnect attempts in the current retry episode.
    pub failed_attempts: u32,
    /// Number of times a connection has been opened. Increments on every
    /// successful (re)connect, so observers can detect each new connection.
    pub opened: u64,
}

impl ConnectionState {
    fn idle() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            disconnected: false,
            failed_attempts: 0,
            opened: 0,
        }
    }

    /// Returns `true` if outbound messages are currently accepted.
    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open
    }
}

/// State shared between every handle and the background task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<ListenerRegistry>,
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionState)) {
        self.state.send_if_modified(|state| {
            let before = *state;
            f(state);
            before != *state
        });
    }

    /// Decode one inbound text frame and hand it to the matching listeners.
    fn dispatch_text(&self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(len = text.len(), "dropping undecodable server message: {e}");
                debug!(raw = %text, "undecodable server message");
                return;
            }
        };
        let kind = message.kind();
        // Collect first so handlers run without the registry lock held.
        let targets = self.registry().listeners_for(kind);
        debug!(%kind, listeners = targets.len(), "dispatching server message");
        for target in &targets {
            target(&message);
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable access to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Hand `message` to the open connection.
    ///
    /// When the connection is not open the message is dropped without error
    /// and without queueing. Returns `true` if the message was handed off.
    /// Delivery is still best-effort: a connection that fails before the
    /// message is written loses it.
    pub fn send(&self, message: ClientMessage) -> bool {
        if !self.state().is_open() {
            debug!(?message, "connection not open, dropping outbound message");
            return false;
        }
        self.shared.cmd_tx.send(message).is_ok()
    }

    /// Register `listener` for every inbound message of `kind`.
    pub fn add_listener(&self, kind: MessageKind, listener: Listener) {
        self.shared.registry().add(kind, listener);
    }

    /// Remove the `(kind, listener)` registration. Returns `true` if found.
    pub fn remove_listener(&self, kind: MessageKind, listener: &Listener) -> bool {
        self.shared.registry().remove(kind, listener)
    }

    /// Number of `(kind, listener)` registrations.
    pub fn listener_count(&self) -> usize {
        self.shared.registry().len()
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    /// Returns `true` while a connection is open.
    pub fn is_ready(&self) -> bool {
        self.state().is_open()
    }

    /// Returns `true` after a failure until the next successful connect.
    pub fn is_disconnected(&self) -> bool {
        self.state().disconnected
    }

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("listeners", &self.shared.registry().len())
            .finish()
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Owner of the background connection task.
///
/// Created via [`ConnectionManager::start`]. Dropping the manager aborts the
/// task; call [`shutdown`](Self::shutdown) to close the transport cleanly.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// Spawn the connection task and begin the first connect attempt.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: Connector>(connector: C, config: ConnectionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (state_tx, _) = watch::channel(ConnectionState::idle());

        let shared = Arc::new(Shared {
            state: state_tx,
            listeners: Mutex::new(ListenerRegistry::new()),
            cmd_tx,
        });
        let shutdown_timeout = config.shutdown_timeout;

        let task = tokio::spawn(connection_loop(
            connector,
            config,
            Arc::clone(&shared),
            cmd_rx,
            shutdown_rx,
        ));

        Self {
            handle: ConnectionHandle { shared },
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        }
    }

    /// A cloneable handle for sending, listening and observing state.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Tear the connection down for good: cancel any retry loop, close the
    /// open transport and move to `Closed(Final)`.
    pub async fn shutdown(&mut self) {
        debug!("ConnectionManager: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection loop aborted: {join_err}");
                    }
                }
            }
        }

        self.handle.shared.update(|state| {
            state.status = ConnectionStatus::Closed(CloseKind::Final);
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.handle.state())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // No executor is available to drive an async close here.
        if let Some(task) = self.task.take() {
            task.abort();
            self.handle.shared.update(|state| {
                state.status = ConnectionStatus::Closed(CloseKind::Final);
            });
        }
    }
}

// ── Background task ─────────────────────────────────────────────────

/// Why an open connection stopped being served.
enum OpenExit {
    Shutdown,
    Lost(String),
}

async fn connection_loop<C: Connector>(
    connector: C,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("connection loop started");
    shared.update(|state| state.status = ConnectionStatus::Connecting);

    // Start of the most recent attempt, shared by every retry episode.
    let mut last_attempt = Instant::now();
    let initial = tokio::select! {
        biased;
        _ = &mut shutdown_rx => None,
        result = attempt(&connector, config.attempt_timeout) => Some(result),
    };

    let mut next = match initial {
        None => None,
        Some(Ok(transport)) => Some(transport),
        Some(Err(e)) => {
            warn!("initial connection failed: {e}");
            reconnect(
                &connector,
                &config,
                &shared,
                &mut last_attempt,
                &mut cmd_rx,
                &mut shutdown_rx,
            )
            .await
        }
    };

    while let Some(mut transport) = next.take() {
        match serve(&mut transport, &shared, &mut cmd_rx, &mut shutdown_rx).await {
            OpenExit::Shutdown => break,
            OpenExit::Lost(reason) => {
                warn!(%reason, "connection lost");
                // Dropping the transport releases the broken socket.
                drop(transport);
                next = reconnect(
                    &connector,
                    &config,
                    &shared,
                    &mut last_attempt,
                    &mut cmd_rx,
                    &mut shutdown_rx,
                )
                .await;
            }
        }
    }

    shared.update(|state| state.status = ConnectionStatus::Closed(CloseKind::Final));
    debug!("connection loop exited");
}

/// One connect attempt bounded by `timeout`. On timeout the connect future is
/// dropped, discarding whatever it was about to produce.
async fn attempt<C: Connector>(connector: &C, timeout: Duration) -> Result<C::Transport> {
    tokio::time::timeout(timeout, connector.connect())
        .await
        .map_err(|_| CounterSyncError::Timeout)?
}

/// Run the retry loop until an attempt succeeds. Returns `None` on shutdown
/// or when `max_retries` is exhausted.
///
/// `last_attempt` outlives the episode: the first retry waits until
/// `attempt_window` has passed since the previous attempt, even if that
/// attempt opened a connection that dropped right away.
async fn reconnect<C: Connector>(
    connector: &C,
    config: &ConnectionConfig,
    shared: &Shared,
    last_attempt: &mut Instant,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Option<C::Transport> {
    shared.update(|state| {
        state.status = ConnectionStatus::Closed(CloseKind::Retrying);
        state.disconnected = true;
        state.failed_attempts = 0;
    });

    let first = (*last_attempt + config.attempt_window).max(Instant::now());
    let mut ticker = tokio::time::interval_at(first, config.retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut *shutdown_rx => return None,
            cmd = cmd_rx.recv() => match cmd {
                Some(message) => debug!(?message, "dropping outbound message while disconnected"),
                None => return None,
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                if now.duration_since(*last_attempt) < config.attempt_window {
                    debug!("reconnect attempt throttled");
                    continue;
                }
                if config.max_retries.is_some_and(|max| failures >= max) {
                    warn!(failures, "giving up on reconnecting");
                    return None;
                }

                *last_attempt = now;
                shared.update(|state| state.status = ConnectionStatus::Connecting);
                debug!(attempt = failures + 1, "reconnect attempt");

                let result = tokio::select! {
                    biased;
                    _ = &mut *shutdown_rx => return None,
                    result = attempt(connector, config.attempt_timeout) => result,
                };
                match result {
                    Ok(transport) => {
                        info!(failures, "reconnected");
                        return Some(transport);
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(failures, "reconnect attempt failed: {e}");
                        shared.update(|state| {
                            state.status = ConnectionStatus::Closed(CloseKind::Retrying);
                            state.failed_attempts = failures;
                        });
                    }
                }
            }
        }
    }
}

/// Pump one open transport until it fails or shutdown is requested.
async fn serve<T: Transport>(
    transport: &mut T,
    shared: &Shared,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> OpenExit {
    shared.update(|state| {
        state.status = ConnectionStatus::Open;
        state.disconnected = false;
        state.failed_attempts = 0;
        state.opened += 1;
    });
    info!("connection open");

    loop {
        tokio::select! {
            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                if let Err(e) = transport.close().await {
                    debug!("transport close failed: {e}");
                }
                return OpenExit::Shutdown;
            }

            cmd = cmd_rx.recv() => {
                let Some(message) = cmd else {
                    let _ = transport.close().await;
                    return OpenExit::Shutdown;
                };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        debug!(?message, "sending client message");
                        if let Err(e) = transport.send(json).await {
                            error!("transport send error: {e}");
                            return OpenExit::Lost(format!("transport send error: {e}"));
                        }
                    }
                    Err(e) => {
                        error!("failed to serialize ClientMessage: {e}");
                    }
                }
            }

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => shared.dispatch_text(&text),
                Some(Err(e)) => return OpenExit::Lost(format!("transport receive error: {e}")),
                None => return OpenExit::Lost("closed by server".into()),
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::listeners::listener;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // ── Mock transport & connector ──────────────────────────────────

    /// Transport fed by an unbounded channel. Dropping the sender side closes
    /// the connection as seen by the client.
    struct ChannelTransport {
        incoming: mpsc::UnboundedReceiver<String>,
        sent: Arc<Mutex<Vec<String>>>,
        alive: Arc<AtomicBool>,
    }

    impl Drop for ChannelTransport {
        fn drop(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Server side of a [`ChannelTransport`].
    struct ServerEnd {
        tx: mpsc::UnboundedSender<String>,
        sent: Arc<Mutex<Vec<String>>>,
        alive: Arc<AtomicBool>,
    }

    fn channel_pair() -> (ChannelTransport, ServerEnd) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let transport = ChannelTransport {
            incoming: rx,
            sent: Arc::clone(&sent),
            alive: Arc::clone(&alive),
        };
        (transport, ServerEnd { tx, sent, alive })
    }

    enum Attempt {
        Open(ChannelTransport),
        Fail,
        /// Opens only after the given delay.
        Late(Duration, ChannelTransport),
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<Attempt>>,
        calls: Arc<AtomicUsize>,
        started: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Attempt>) -> (Self, Arc<AtomicUsize>) {
            let (connector, calls, _started) = Self::timed(script);
            (connector, calls)
        }

        /// Like [`ScriptedConnector::new`], also recording when each attempt
        /// started.
        fn timed(script: Vec<Attempt>) -> (Self, Arc<AtomicUsize>, Arc<Mutex<Vec<Instant>>>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let started = Arc::new(Mutex::new(Vec::new()));
            let connector = Self {
                script: Mutex::new(script.into()),
                calls: Arc::clone(&calls),
                started: Arc::clone(&started),
            };
            (connector, calls, started)
        }
    }

    /// Offsets of the recorded attempt starts from `origin`.
    fn offsets(started: &Mutex<Vec<Instant>>, origin: Instant) -> Vec<Duration> {
        started
            .lock()
            .unwrap()
            .iter()
            .map(|at| at.duration_since(origin))
            .collect()
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Transport = ChannelTransport;

        async fn connect(&self) -> Result<ChannelTransport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().push(Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Attempt::Open(transport)) => Ok(transport),
                Some(Attempt::Fail) => Err(CounterSyncError::TransportClosed),
                Some(Attempt::Late(delay, transport)) => {
                    tokio::time::sleep(delay).await;
                    Ok(transport)
                }
                // Script exhausted: hang until the attempt times out.
                None => std::future::pending().await,
            }
        }
    }

    async fn wait_until(
        handle: &ConnectionHandle,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = handle.subscribe();
        let state = *rx.wait_for(predicate).await.unwrap();
        state
    }

    fn log_json(message: &str) -> String {
        serde_json::to_string(&ServerMessage::Log {
            message: message.into(),
        })
        .unwrap()
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn opens_and_dispatches_only_decodable_messages() {
        let (transport, server) = channel_pair();
        let (connector, _calls) = ScriptedConnector::new(vec![Attempt::Open(transport)]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        handle.add_listener(
            MessageKind::Log,
            listener(move |msg| {
                let _ = seen_tx.send(msg.clone());
            }),
        );

        let state = wait_until(&handle, |s| s.is_open()).await;
        assert_eq!(state.opened, 1);
        assert!(!state.disconnected);

        server.tx.send("not json".into()).unwrap();
        server
            .tx
            .send(r#"{"type":"Scoreboard","rows":[]}"#.into())
            .unwrap();
        server.tx.send(log_json("hello")).unwrap();

        let msg = seen_rx.recv().await.unwrap();
        assert_eq!(
            msg,
            ServerMessage::Log {
                message: "hello".into()
            }
        );
        assert!(seen_rx.try_recv().is_err());
        assert!(handle.is_ready());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn listener_can_remove_itself_while_dispatching() {
        let (transport, server) = channel_pair();
        let (connector, _calls) = ScriptedConnector::new(vec![Attempt::Open(transport)]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();

        let fired = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));
        let once = {
            let fired = Arc::clone(&fired);
            let slot = Arc::clone(&slot);
            let handle = handle.clone();
            listener(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().take() {
                    assert!(handle.remove_listener(MessageKind::Log, &me));
                }
            })
        };
        *slot.lock().unwrap() = Some(Arc::clone(&once));
        handle.add_listener(MessageKind::Log, once);
        wait_until(&handle, |s| s.is_open()).await;

        server.tx.send(log_json("first")).unwrap();
        server.tx.send(log_json("second")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handle.listener_count(), 0);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_is_silent_noop_until_open() {
        let (connector, _calls) = ScriptedConnector::new(vec![]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();

        assert!(!handle.send(ClientMessage::AddCount { data: 1 }));
        assert!(!handle.is_ready());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_messages_reach_the_transport() {
        let (transport, server) = channel_pair();
        let (connector, _calls) = ScriptedConnector::new(vec![Attempt::Open(transport)]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();
        wait_until(&handle, |s| s.is_open()).await;

        assert!(handle.send(ClientMessage::SetName {
            data: "Alice".into()
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = server.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![r#"{"type":"SetName","data":"Alice"}"#.to_string()]);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_server_close_and_keeps_listeners() {
        let (first, first_server) = channel_pair();
        let (second, second_server) = channel_pair();
        let (connector, calls) =
            ScriptedConnector::new(vec![Attempt::Open(first), Attempt::Open(second)]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        handle.add_listener(
            MessageKind::Log,
            listener(move |msg| {
                let _ = seen_tx.send(msg.clone());
            }),
        );
        wait_until(&handle, |s| s.opened == 1).await;

        drop(first_server.tx);
        let state = wait_until(&handle, |s| s.opened == 2).await;
        assert!(state.is_open());
        assert!(!state.disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        second_server.tx.send(log_json("again")).unwrap();
        assert!(matches!(
            seen_rx.recv().await.unwrap(),
            ServerMessage::Log { .. }
        ));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_connect_flags_disconnected() {
        let (connector, calls) = ScriptedConnector::new(vec![Attempt::Fail, Attempt::Fail]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();

        let state = wait_until(&handle, |s| s.failed_attempts >= 1).await;
        assert!(state.disconnected);
        assert_eq!(state.status, ConnectionStatus::Closed(CloseKind::Retrying));
        assert_eq!(state.opened, 0);
        assert!(calls.load(Ordering::SeqCst) >= 2);

        manager.shutdown().await;
        assert_eq!(handle.status(), ConnectionStatus::Closed(CloseKind::Final));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_that_outlives_timeout_is_discarded() {
        let (late, late_server) = channel_pair();
        let (good, good_server) = channel_pair();
        let (connector, calls) = ScriptedConnector::new(vec![
            Attempt::Fail,
            Attempt::Late(Duration::from_millis(800), late),
            Attempt::Open(good),
        ]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();

        // t=0 initial fail, t=500 late attempt abandoned at t=1000.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!late_server.alive.load(Ordering::SeqCst));
        assert!(!handle.is_ready());

        // Past the point where the abandoned attempt would have opened.
        let state = wait_until(&handle, |s| s.is_open()).await;
        assert_eq!(state.opened, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(good_server.alive.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(handle.state().opened, 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_fixed_cadence() {
        let (connector, calls, started) = ScriptedConnector::timed(vec![]);
        let config = ConnectionConfig::new().with_attempt_timeout(Duration::from_millis(100));
        let origin = Instant::now();
        let mut manager = ConnectionManager::start(connector, config.clone());

        // Initial attempt at t=0 times out at t=100. The first retry waits
        // out the attempt window, later ones follow the retry interval.
        tokio::time::sleep(Duration::from_millis(2650)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let at = offsets(&started, origin);
        assert_eq!(
            at,
            [0, 500, 1500, 2500].map(Duration::from_millis).to_vec()
        );
        for pair in at.windows(2) {
            assert!(pair[1] - pair[0] >= config.attempt_window);
        }

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connection_that_drops_at_once_is_not_retried_inside_the_window() {
        let mut script = Vec::new();
        for _ in 0..3 {
            // Dropping the server end makes the transport close on first read.
            let (transport, _server) = channel_pair();
            script.push(Attempt::Open(transport));
        }
        let (connector, calls, started) = ScriptedConnector::timed(script);
        let config = ConnectionConfig::new();
        let origin = Instant::now();
        let mut manager = ConnectionManager::start(connector, config.clone());
        let handle = manager.handle();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.state().opened, 3);
        let at = offsets(&started, origin);
        assert_eq!(at, [0, 500, 1000].map(Duration::from_millis).to_vec());
        for pair in at.windows(2) {
            assert!(pair[1] - pair[0] >= config.attempt_window);
        }

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn max_retries_moves_to_final() {
        let (connector, calls) = ScriptedConnector::new(vec![
            Attempt::Fail,
            Attempt::Fail,
            Attempt::Fail,
            Attempt::Fail,
        ]);
        let mut manager =
            ConnectionManager::start(connector, ConnectionConfig::new().with_max_retries(2));
        let handle = manager.handle();

        let state = wait_until(&handle, |s| {
            s.status == ConnectionStatus::Closed(CloseKind::Final)
        })
        .await;
        assert!(state.disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_for_good() {
        let (transport, server) = channel_pair();
        let (connector, calls) = ScriptedConnector::new(vec![Attempt::Open(transport)]);
        let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
        let handle = manager.handle();
        wait_until(&handle, |s| s.is_open()).await;

        manager.shutdown().await;
        assert_eq!(handle.status(), ConnectionStatus::Closed(CloseKind::Final));
        assert!(!server.alive.load(Ordering::SeqCst));
        assert!(!handle.send(ClientMessage::AddCount { data: 1 }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Log sink for checking what a subscriber would print.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn undecodable_frame_body_stays_out_of_warn_logs() {
        let (state, _state_rx) = watch::channel(ConnectionState::idle());
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            state,
            listeners: Mutex::new(ListenerRegistry::new()),
            cmd_tx,
        };

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let frame = format!("garbage {}", "x".repeat(4096));
        tracing::subscriber::with_default(subscriber, || shared.dispatch_text(&frame));

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("dropping undecodable server message"));
        assert!(output.contains("len=4104"));
        assert!(!output.contains(&"x".repeat(64)));
    }

    #[test]
    fn config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.retry_interval, Duration::from_millis(1000));
        assert_eq!(config.attempt_window, Duration::from_millis(500));
        assert_eq!(config.attempt_timeout, Duration::from_millis(500));
        assert_eq!(config.max_retries, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }
}
