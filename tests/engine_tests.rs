#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for `SyncEngine` on a paused clock.
//!
//! A real `ConnectionManager` runs over the loopback connector, so these
//! tests exercise batching, interpolation, name announcement and reconnect
//! exactly as an application would see them.

mod common;

use std::sync::Arc;
use std::time::Duration;

use counter_sync::protocol::ClientMessage;
use counter_sync::{
    ConnectionConfig, ConnectionManager, CounterSyncError, FileNameStore, MemoryNameStore,
    NameStore, SyncConfig, SyncEngine, Totals,
};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_test::{assert_err, assert_ok};

use common::{
    loopback_connector, scores, update_state, wait_for_connection, ConnectorControl, ServerSide,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

struct Game {
    manager: ConnectionManager,
    engine: SyncEngine,
    control: ConnectorControl,
    server: ServerSide,
}

/// Start a connection and an engine, wait for the connection to open and
/// let the engine observe it.
async fn start_game(store: Arc<dyn NameStore>, config: SyncConfig) -> Game {
    let (connector, mut control) = loopback_connector();
    let manager = ConnectionManager::start(connector, ConnectionConfig::new());
    let engine = SyncEngine::start(manager.handle(), store, config);
    let server = control.accept().await;
    wait_for_connection(&manager.handle(), |s| s.is_open()).await;
    settle().await;
    Game {
        manager,
        engine,
        control,
        server,
    }
}

/// Let every background task run until it waits on a timer.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

fn add_count(data: i64) -> ClientMessage {
    ClientMessage::AddCount { data }
}

fn set_name(name: &str) -> ClientMessage {
    ClientMessage::SetName { data: name.into() }
}

// ════════════════════════════════════════════════════════════════════
// Full session
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn first_session_batches_five_clicks_into_one_add_count() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;

    // No name yet: nothing is declared.
    assert!(game.server.drain().is_empty());
    assert!(!game.engine.view().can_play());

    assert_ok!(game.engine.set_name("Alice"));
    assert_eq!(game.server.next_client_message().await, Some(set_name("Alice")));

    game.server.push(&update_state(&[("Alice", 0)]));
    let mut board = game.engine.subscribe();
    board.wait_for(|b| b.is_loaded()).await.unwrap();
    assert_eq!(game.engine.view().interpolated, scores(&[("Alice", 0)]));

    let start = Instant::now();
    for click in 1..=5 {
        assert_ok!(game.engine.apply_local_increment(1));
        assert_eq!(
            game.engine.totals(),
            Totals {
                server: click,
                interpolated: click
            }
        );
        if click < 5 {
            sleep(Duration::from_millis(150)).await;
        }
    }

    assert_eq!(game.server.next_client_message().await, Some(add_count(5)));
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1050),
        "flushed after {elapsed:?}"
    );

    // Server confirms; nothing moves and nothing more is sent.
    game.server.push(&update_state(&[("Alice", 5)]));
    sleep(Duration::from_secs(2)).await;
    assert!(game.server.drain().is_empty());
    assert_eq!(
        game.engine.totals(),
        Totals {
            server: 5,
            interpolated: 5
        }
    );
    assert_eq!(game.engine.board().pending(), 0);

    game.engine.shutdown().await;
    game.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Batching
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn each_flush_window_sends_one_message() {
    let store = Arc::new(MemoryNameStore::with_name("Alice"));
    let mut game = start_game(store, SyncConfig::new()).await;
    assert_eq!(game.server.next_client_message().await, Some(set_name("Alice")));

    let start = Instant::now();
    game.engine.apply_local_increment(1).unwrap();
    sleep(Duration::from_millis(100)).await;
    game.engine.apply_local_increment(1).unwrap();
    sleep(Duration::from_millis(100)).await;
    game.engine.apply_local_increment(1).unwrap();

    assert_eq!(game.server.next_client_message().await, Some(add_count(3)));

    // A second burst opens a new window.
    sleep_until(start + Duration::from_millis(1500)).await;
    game.engine.apply_local_increment(2).unwrap();
    game.engine.apply_local_increment(-1).unwrap();
    assert_eq!(game.server.next_client_message().await, Some(add_count(1)));
    assert!(start.elapsed() >= Duration::from_millis(2500));

    sleep(Duration::from_secs(3)).await;
    assert!(game.server.drain().is_empty());

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn increments_that_cancel_out_send_nothing() {
    let store = Arc::new(MemoryNameStore::with_name("Alice"));
    let mut game = start_game(store, SyncConfig::new()).await;
    assert_eq!(game.server.next_client_message().await, Some(set_name("Alice")));

    game.engine.apply_local_increment(3).unwrap();
    game.engine.apply_local_increment(-3).unwrap();
    sleep(Duration::from_secs(2)).await;
    assert!(game.server.drain().is_empty());

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn increment_without_name_is_rejected() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;

    let err = assert_err!(game.engine.apply_local_increment(1));
    assert!(matches!(err, CounterSyncError::NotReady));
    assert_eq!(game.engine.board().pending(), 0);
    assert!(!game.engine.view().loaded);

    sleep(Duration::from_secs(2)).await;
    assert!(game.server.drain().is_empty());

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_is_held_while_disconnected() {
    let store = Arc::new(MemoryNameStore::with_name("Alice"));
    let Game {
        mut manager,
        engine,
        mut control,
        mut server,
    } = start_game(store, SyncConfig::new()).await;
    assert_eq!(server.next_client_message().await, Some(set_name("Alice")));

    let handle = manager.handle();
    control.set_refuse(true);
    drop(server);
    wait_for_connection(&handle, |s| s.disconnected).await;

    engine.apply_local_increment(1).unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.board().pending(), 1);
    assert!(engine.view().disconnected);

    control.set_refuse(false);
    let mut server = control.accept().await;
    assert_eq!(server.next_client_message().await, Some(set_name("Alice")));
    assert_eq!(server.next_client_message().await, Some(add_count(1)));
    assert_eq!(engine.board().pending(), 0);

    manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Interpolation
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn interpolation_counts_up_one_step_per_tick_then_stops() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;

    game.engine.apply_snapshot(scores(&[("Bob", 0)]));
    let start = Instant::now();
    game.engine.apply_snapshot(scores(&[("Bob", 10)]));
    assert_eq!(game.engine.view().interpolated["Bob"], 0);

    sleep_until(start + Duration::from_millis(500)).await;
    assert_eq!(game.engine.view().interpolated["Bob"], 3);

    sleep_until(start + Duration::from_millis(1500)).await;
    assert_eq!(game.engine.view().interpolated["Bob"], 10);

    let mut board = game.engine.subscribe();
    board.borrow_and_update();
    sleep(Duration::from_secs(1)).await;
    assert!(!board.has_changed().unwrap());

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn decreases_land_in_a_single_tick() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;

    game.engine.apply_snapshot(scores(&[("Bob", 10)]));
    game.engine.apply_snapshot(scores(&[("Bob", 4)]));
    assert_eq!(game.engine.view().interpolated["Bob"], 10);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(game.engine.view().interpolated["Bob"], 4);

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn player_joining_snaps_the_view() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;

    game.server.push(&update_state(&[("A", 1), ("B", 1)]));
    game.server.push(&update_state(&[("A", 5), ("B", 1)]));
    game.server.push(&update_state(&[("A", 7), ("B", 2), ("C", 0)]));

    let mut board = game.engine.subscribe();
    let snapshot = board
        .wait_for(|b| b.server_state().is_some_and(|s| s.contains_key("C")))
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.interpolated_state(), snapshot.server_state());
    assert_eq!(
        game.engine.view().interpolated,
        scores(&[("A", 7), ("B", 2), ("C", 0)])
    );

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn own_increment_is_never_animated() {
    let store = Arc::new(MemoryNameStore::with_name("Bob"));
    let mut game = start_game(store, SyncConfig::new()).await;

    game.engine.apply_snapshot(scores(&[("Bob", 5), ("Carol", 2)]));
    game.engine.apply_local_increment(3).unwrap();

    let view = game.engine.view();
    assert_eq!(view.state["Bob"], 8);
    assert_eq!(view.interpolated["Bob"], 8);
    assert_eq!(
        view.totals,
        Totals {
            server: 10,
            interpolated: 10
        }
    );

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn own_entry_follows_stale_and_catch_up_snapshots() {
    let store = Arc::new(MemoryNameStore::with_name("Bob"));
    let mut game = start_game(store, SyncConfig::new()).await;

    game.engine.apply_snapshot(scores(&[("Bob", 0)]));
    game.engine.apply_local_increment(5).unwrap();
    game.engine.apply_snapshot(scores(&[("Bob", 0)]));
    assert_eq!(game.engine.view().interpolated["Bob"], 0);

    sleep(Duration::from_millis(200)).await;
    game.engine.apply_snapshot(scores(&[("Bob", 5)]));
    let view = game.engine.view();
    assert_eq!(view.interpolated["Bob"], 5);
    assert_eq!(view.state["Bob"], 5);
    assert_eq!(view.totals.interpolated, view.totals.server);

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn first_snapshot_is_adopted_after_an_early_increment() {
    let store = Arc::new(MemoryNameStore::with_name("Alice"));
    let mut game = start_game(store, SyncConfig::new()).await;

    game.engine.apply_local_increment(1).unwrap();
    assert_eq!(game.engine.view().interpolated, scores(&[("Alice", 1)]));

    let mut board = game.engine.subscribe();
    game.server.push(&update_state(&[("Bob", 3)]));
    board
        .wait_for(|b| b.server_state().is_some_and(|s| s.contains_key("Bob")))
        .await
        .unwrap();

    let view = game.engine.view();
    assert_eq!(view.state, scores(&[("Bob", 3)]));
    assert_eq!(view.interpolated, scores(&[("Bob", 3)]));

    game.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Snapshots racing the flush
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn stale_snapshot_replaces_unsent_increment_by_default() {
    let store = Arc::new(MemoryNameStore::with_name("Alice"));
    let mut game = start_game(store, SyncConfig::new()).await;

    game.engine.apply_snapshot(scores(&[("Alice", 0)]));
    game.engine.apply_local_increment(2).unwrap();
    game.engine.apply_snapshot(scores(&[("Alice", 0)]));

    assert_eq!(game.engine.view().state["Alice"], 0);
    // The delta is still sent; the next snapshot will include it.
    assert_eq!(game.engine.board().pending(), 2);

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_overlay_keeps_unsent_increment_visible() {
    let store = Arc::new(MemoryNameStore::with_name("Alice"));
    let config = SyncConfig::new().with_pending_overlay(true);
    let mut game = start_game(store, config).await;

    game.engine.apply_snapshot(scores(&[("Alice", 0)]));
    game.engine.apply_local_increment(2).unwrap();
    game.engine.apply_snapshot(scores(&[("Alice", 0), ("Bob", 1)]));

    let view = game.engine.view();
    assert_eq!(view.state, scores(&[("Alice", 2), ("Bob", 1)]));
    assert_eq!(view.interpolated, scores(&[("Alice", 2), ("Bob", 1)]));

    game.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Names
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn name_is_declared_again_after_reconnect() {
    let (connector, mut control) = loopback_connector();
    let mut manager = ConnectionManager::start(connector, ConnectionConfig::new());
    let engine = SyncEngine::start(
        manager.handle(),
        Arc::new(MemoryNameStore::new()),
        SyncConfig::new(),
    );

    let mut server = control.accept().await;
    wait_for_connection(&manager.handle(), |s| s.is_open()).await;
    settle().await;
    engine.set_name("Alice").unwrap();
    assert_eq!(server.next_client_message().await, Some(set_name("Alice")));

    drop(server);
    let mut server = control.accept().await;
    assert_eq!(server.next_client_message().await, Some(set_name("Alice")));
    settle().await;
    assert!(server.drain().is_empty());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn blank_or_unchanged_names_send_nothing() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;

    assert!(matches!(
        game.engine.set_name("   "),
        Err(CounterSyncError::EmptyName)
    ));
    assert_eq!(game.engine.name(), None);

    game.engine.set_name(" Alice ").unwrap();
    game.engine.set_name("Alice").unwrap();
    assert_eq!(game.engine.name().as_deref(), Some("Alice"));

    settle().await;
    assert_eq!(game.server.drain(), vec![set_name("Alice")]);

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn name_is_persisted_and_restored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profile").join("name");

    {
        let store = Arc::new(FileNameStore::new(&path));
        let mut game = start_game(store, SyncConfig::new()).await;
        assert!(game.server.drain().is_empty());

        game.engine.set_name("  Alice  ").unwrap();
        assert_eq!(game.server.next_client_message().await, Some(set_name("Alice")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Alice");

        game.engine.shutdown().await;
        game.manager.shutdown().await;
    }

    let store = Arc::new(FileNameStore::new(&path));
    let mut game = start_game(store, SyncConfig::new()).await;
    assert_eq!(game.engine.name().as_deref(), Some("Alice"));
    assert!(game.engine.view().can_play());
    // Declared on open without calling set_name.
    assert_eq!(game.server.drain(), vec![set_name("Alice")]);

    game.manager.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Teardown
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn shutdown_stops_listening_for_snapshots() {
    let mut game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;
    let handle = game.manager.handle();
    assert_eq!(handle.listener_count(), 1);

    game.engine.shutdown().await;
    assert_eq!(handle.listener_count(), 0);

    game.server.push(&update_state(&[("Bob", 3)]));
    settle().await;
    assert!(!game.engine.board().is_loaded());

    game.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropping_the_engine_unregisters_it() {
    let game = start_game(Arc::new(MemoryNameStore::new()), SyncConfig::new()).await;
    let handle = game.manager.handle();
    assert_eq!(handle.listener_count(), 1);

    drop(game.engine);
    assert_eq!(handle.listener_count(), 0);
}
