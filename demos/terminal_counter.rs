//! # Terminal Counter Example
//!
//! A line-oriented client for the counter game server:
//!
//! 1. Connect over WebSocket and keep reconnecting in the background
//! 2. Restore the player name from a file, or ask for one
//! 3. Apply increments optimistically and batch them to the server
//! 4. Print the scoreboard and the activity feed as they change
//! 5. Shut down gracefully on `quit`, end of input or Ctrl+C
//!
//! ## Commands
//!
//! ```text
//! +            add one point
//! +5 / -2      add (or remove) several points
//! name Alice   choose or change your name
//! say hello    send a chat line
//! quit         leave
//! ```
//!
//! ## Running
//!
//! ```sh
//! # Start the counter server on localhost:7776, then:
//! cargo run --example terminal_counter
//!
//! # Override the server URL or the name file:
//! COUNTER_URL=ws://my-server:7776 COUNTER_NAME_FILE=/tmp/name \
//!     cargo run --example terminal_counter
//! ```

use std::sync::Arc;

use counter_sync::{
    ActivityFeed, ConnectionConfig, ConnectionManager, FeedConfig, FeedEntry, FileNameStore,
    GameView, SyncConfig, SyncEngine, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Default server URL when `COUNTER_URL` is not set.
const DEFAULT_URL: &str = "ws://127.0.0.1:7776";

/// Default name file when `COUNTER_NAME_FILE` is not set.
const DEFAULT_NAME_FILE: &str = ".counter-name";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("COUNTER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let name_file =
        std::env::var("COUNTER_NAME_FILE").unwrap_or_else(|_| DEFAULT_NAME_FILE.to_string());
    tracing::info!("Connecting to {url}");

    // ── Wiring ──────────────────────────────────────────────────────
    let mut manager = ConnectionManager::start(WebSocketConnector::new(url), ConnectionConfig::new());
    let mut engine = SyncEngine::start(
        manager.handle(),
        Arc::new(FileNameStore::new(name_file)),
        SyncConfig::new(),
    );
    let feed = ActivityFeed::attach(manager.handle(), FeedConfig::new());

    match engine.name() {
        Some(name) => println!("Welcome back, {name}. Type `+` to score."),
        None => println!("Pick a name first: `name <your name>`"),
    }

    let mut board = engine.subscribe();
    let mut connection = manager.handle().subscribe();
    let mut feed_rx = feed.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_command(line.trim(), &engine, &feed) {
                    break;
                }
            }

            changed = board.changed() => {
                if changed.is_err() {
                    break;
                }
                board.borrow_and_update();
                render(&engine.view());
            }

            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                if state.disconnected {
                    println!("-- disconnected, retrying ({} failed attempts)", state.failed_attempts);
                } else if state.is_open() {
                    println!("-- connected");
                }
            }

            entry = feed_rx.recv() => {
                match entry {
                    Ok(FeedEntry::Log { message, .. }) => println!("[log] {message}"),
                    Ok(FeedEntry::Chat { username, message, local: false, .. }) => {
                        println!("<{username}> {message}");
                    }
                    Ok(FeedEntry::Chat { .. }) => {}
                    Err(e) => tracing::debug!("feed receiver: {e}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    engine.shutdown().await;
    manager.shutdown().await;
    println!("Bye!");
    Ok(())
}

/// Run one command. Returns `false` when the user wants to leave.
fn handle_command(line: &str, engine: &SyncEngine, feed: &ActivityFeed) -> bool {
    if line == "quit" {
        return false;
    }
    if let Some(name) = line.strip_prefix("name ") {
        if let Err(e) = engine.set_name(name) {
            println!("!! {e}");
        }
    } else if let Some(text) = line.strip_prefix("say ") {
        if !feed.send_chat(engine.name().as_deref(), text) {
            println!("!! not sent (no name yet, or not connected)");
        }
    } else if let Some(amount) = parse_amount(line) {
        if let Err(e) = engine.apply_local_increment(amount) {
            println!("!! {e}");
        }
    } else if !line.is_empty() {
        println!("!! unknown command: {line}");
    }
    true
}

fn parse_amount(line: &str) -> Option<i64> {
    match line {
        "+" => Some(1),
        "-" => Some(-1),
        _ => line.parse().ok(),
    }
}

fn render(view: &GameView) {
    if !view.loaded {
        return;
    }
    let scores: Vec<String> = view
        .interpolated
        .iter()
        .map(|(player, score)| {
            if view.name.as_deref() == Some(player.as_str()) {
                format!("*{player}*: {score}")
            } else {
                format!("{player}: {score}")
            }
        })
        .collect();
    println!("{}  (total {})", scores.join("  "), view.totals.interpolated);
}
