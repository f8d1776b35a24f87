//! # Loopback Counter Example
//!
//! Shows how to implement the [`Connector`] and [`Transport`] traits with an
//! in-process server. The server keeps its own score table, applies
//! `SetName` and `AddCount`, and broadcasts `UpdateState` after every change,
//! which is enough to watch batching and interpolation work without a network.
//!
//! A scripted bot scores alongside the local player so the interpolated view
//! has something to animate.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_counter
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use counter_sync::protocol::{ClientMessage, ScoreMap, ServerMessage};
use counter_sync::{
    ConnectionConfig, ConnectionManager, Connector, CounterSyncError, MemoryNameStore, SyncConfig,
    SyncEngine, Transport,
};
use tokio::sync::{mpsc, Mutex};

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based transport
// ─────────────────────────────────────────────────────────────────────

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

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that starts a server session per connection
// ─────────────────────────────────────────────────────────────────────

/// Score table shared by every session.
type Scores = Arc<Mutex<ScoreMap>>;

struct LoopbackConnector {
    scores: Scores,
}

#[async_trait]
impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, CounterSyncError> {
        // Client → server
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        // Server → client
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        tokio::spawn(server_session(
            Arc::clone(&self.scores),
            server_rx,
            server_tx,
        ));

        Ok(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

/// Serve one client until it disconnects.
async fn server_session(
    scores: Scores,
    mut rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut name: Option<String> = None;
    while let Some(text) = rx.recv().await {
        let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        let reply = match message {
            ClientMessage::SetName { data } => {
                scores.lock().await.entry(data.clone()).or_insert(0);
                let line = ServerMessage::Log {
                    message: format!("{data} logged in"),
                };
                name = Some(data);
                Some(line)
            }
            ClientMessage::AddCount { data } => match &name {
                Some(name) => {
                    *scores.lock().await.entry(name.clone()).or_insert(0) += data;
                    None
                }
                None => continue,
            },
            ClientMessage::SendMessage { .. } => continue,
        };

        if let Some(line) = reply {
            if send(&tx, &line).is_err() {
                break;
            }
        }
        let snapshot = ServerMessage::UpdateState {
            new_state: scores.lock().await.clone(),
        };
        if send(&tx, &snapshot).is_err() {
            break;
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, message: &ServerMessage) -> Result<(), CounterSyncError> {
    let text = serde_json::to_string(message)?;
    tx.send(text).map_err(|_| CounterSyncError::TransportClosed)
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Play
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let scores: Scores = Arc::new(Mutex::new(ScoreMap::new()));
    scores.lock().await.insert("Bot".into(), 0);

    let mut manager = ConnectionManager::start(
        LoopbackConnector {
            scores: Arc::clone(&scores),
        },
        ConnectionConfig::new(),
    );
    let mut engine = SyncEngine::start(
        manager.handle(),
        Arc::new(MemoryNameStore::new()),
        SyncConfig::new(),
    );

    let mut connection = manager.handle().subscribe();
    connection.wait_for(|s| s.is_open()).await?;
    engine.set_name("Alice")?;

    // The bot scores in bursts straight on the server side.
    let bot = {
        let scores = Arc::clone(&scores);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                *scores.lock().await.entry("Bot".into()).or_insert(0) += 4;
            }
        })
    };

    for round in 0..20 {
        if round % 2 == 0 {
            engine.apply_local_increment(1)?;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        let view = engine.view();
        println!(
            "t={:>4}ms  shown={:?}  authoritative={:?}",
            round * 250,
            view.interpolated,
            view.state
        );
    }

    bot.abort();
    engine.shutdown().await;
    manager.shutdown().await;
    Ok(())
}
