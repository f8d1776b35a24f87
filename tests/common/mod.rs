#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for counter-sync integration tests.
//!
//! Provides a channel-based loopback [`Connector`]: every successful connect
//! creates a fresh client/server channel pair and hands the server half to the
//! test through [`ConnectorControl::servers`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use counter_sync::protocol::{ClientMessage, ScoreMap, ServerMessage};
use counter_sync::{ConnectionHandle, ConnectionState, Connector, CounterSyncError, Transport};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ── Loopback transport ──────────────────────────────────────────────

/// Client half of an in-process connection.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), CounterSyncError> {
        self.tx
            .send(message)
            .map_err(|e| CounterSyncError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, CounterSyncError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), CounterSyncError> {
        Ok(())
    }
}

/// Server half of an in-process connection. Dropping it closes the
/// connection from the client's point of view.
pub struct ServerSide {
    pub rx: mpsc::UnboundedReceiver<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

impl ServerSide {
    /// Send a typed message to the client.
    pub fn push(&self, message: &ServerMessage) {
        self.push_raw(serde_json::to_string(message).unwrap());
    }

    /// Send raw text to the client.
    pub fn push_raw(&self, text: impl Into<String>) {
        self.tx.send(text.into()).unwrap();
    }

    /// Wait for the next message the client sends.
    pub async fn next_client_message(&mut self) -> Option<ClientMessage> {
        let text = self.rx.recv().await?;
        Some(serde_json::from_str(&text).unwrap())
    }

    /// Everything the client has sent so far without waiting.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }
}

// ── Loopback connector ──────────────────────────────────────────────

pub struct LoopbackConnector {
    servers: mpsc::UnboundedSender<ServerSide>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    attempt_times: Arc<Mutex<Vec<Instant>>>,
}

/// Test-side controls for a [`LoopbackConnector`].
pub struct ConnectorControl {
    /// One entry per successful connect.
    pub servers: mpsc::UnboundedReceiver<ServerSide>,
    /// While `true`, every connect attempt fails immediately.
    pub refuse: Arc<AtomicBool>,
    /// Number of connect attempts made so far.
    pub attempts: Arc<AtomicUsize>,
    /// When each connect attempt started.
    pub attempt_times: Arc<Mutex<Vec<Instant>>>,
}

impl ConnectorControl {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> ServerSide {
        self.servers.recv().await.expect("connector dropped")
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }
}

pub fn loopback_connector() -> (LoopbackConnector, ConnectorControl) {
    let (servers_tx, servers_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempt_times = Arc::new(Mutex::new(Vec::new()));
    let connector = LoopbackConnector {
        servers: servers_tx,
        refuse: Arc::clone(&refuse),
        attempts: Arc::clone(&attempts),
        attempt_times: Arc::clone(&attempt_times),
    };
    let control = ConnectorControl {
        servers: servers_rx,
        refuse,
        attempts,
        attempt_times,
    };
    (connector, control)
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, CounterSyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().unwrap().push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CounterSyncError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }

        // Client → server
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        // Server → client
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        self.servers
            .send(ServerSide {
                rx: server_rx,
                tx: server_tx,
            })
            .map_err(|_| CounterSyncError::TransportClosed)?;

        Ok(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a score map from `(name, score)` pairs.
pub fn scores(entries: &[(&str, i64)]) -> ScoreMap {
    entries
        .iter()
        .map(|(name, score)| (name.to_string(), *score))
        .collect()
}

pub fn update_state(entries: &[(&str, i64)]) -> ServerMessage {
    ServerMessage::UpdateState {
        new_state: scores(entries),
    }
}

pub fn log(message: &str) -> ServerMessage {
    ServerMessage::Log {
        message: message.into(),
    }
}

pub fn chat(username: &str, message: &str) -> ServerMessage {
    ServerMessage::ChatMessage {
        message: message.into(),
        username: username.into(),
    }
}

/// Assert that consecutive attempts started at least `window` apart.
pub fn assert_spaced(times: &[Instant], window: std::time::Duration) {
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= window, "attempts only {gap:?} apart: {times:?}");
    }
}

/// Wait until the connection state satisfies `predicate`.
pub async fn wait_for_connection(
    handle: &ConnectionHandle,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut rx = handle.subscribe();
    let state = *rx.wait_for(predicate).await.expect("connection dropped");
    state
}
