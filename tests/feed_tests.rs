#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for `ActivityFeed`.

mod common;

use counter_sync::protocol::ClientMessage;
use counter_sync::{ActivityFeed, ConnectionConfig, ConnectionManager, FeedConfig, FeedEntry};

use common::{chat, log, loopback_connector, update_state, wait_for_connection, ServerSide};

async fn open_feed(config: FeedConfig) -> (ConnectionManager, ActivityFeed, ServerSide) {
    let (connector, mut control) = loopback_connector();
    let manager = ConnectionManager::start(connector, ConnectionConfig::new());
    let feed = ActivityFeed::attach(manager.handle(), config);
    let server = control.accept().await;
    wait_for_connection(&manager.handle(), |s| s.is_open()).await;
    (manager, feed, server)
}

#[tokio::test]
async fn collects_logs_and_chat_in_arrival_order() {
    let (mut manager, feed, server) = open_feed(FeedConfig::new()).await;
    let mut updates = feed.subscribe();

    server.push(&log("Alice logged in"));
    server.push(&update_state(&[("Alice", 0)]));
    server.push(&chat("Alice", "hi all"));

    let first = updates.recv().await.unwrap();
    let second = updates.recv().await.unwrap();
    assert_eq!(first.message(), "Alice logged in");
    assert!(matches!(
        second,
        FeedEntry::Chat { ref username, local: false, .. } if username == "Alice"
    ));

    let entries = feed.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(feed.logs().len(), 1);
    assert_eq!(feed.chat().len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn send_chat_echoes_locally_and_sends_trimmed_text() {
    let (mut manager, feed, mut server) = open_feed(FeedConfig::new()).await;

    assert!(feed.send_chat(Some("Alice"), "  good game  "));
    assert_eq!(
        server.next_client_message().await,
        Some(ClientMessage::SendMessage {
            data: "good game".into()
        })
    );

    let lines = feed.chat();
    assert_eq!(lines.len(), 1);
    match &lines[0] {
        FeedEntry::Chat {
            username,
            message,
            local,
            ..
        } => {
            assert_eq!(username, "Alice");
            assert_eq!(message, "good game");
            assert!(*local);
        }
        other => panic!("expected chat entry, got {other:?}"),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn send_chat_ignores_blank_text_and_missing_name() {
    let (mut manager, feed, mut server) = open_feed(FeedConfig::new()).await;

    assert!(!feed.send_chat(Some("Alice"), "   "));
    assert!(!feed.send_chat(None, "hello"));
    assert!(feed.entries().is_empty());

    tokio::task::yield_now().await;
    assert!(server.drain().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn oldest_entries_are_dropped_beyond_capacity() {
    let (mut manager, feed, server) = open_feed(FeedConfig::new().with_capacity(3)).await;
    let mut updates = feed.subscribe();

    for n in 0..5 {
        server.push(&log(&format!("line {n}")));
    }
    for _ in 0..5 {
        updates.recv().await.unwrap();
    }

    let messages: Vec<String> = feed
        .entries()
        .iter()
        .map(|e| e.message().to_string())
        .collect();
    assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);

    manager.shutdown().await;
}

#[tokio::test]
async fn dropping_the_feed_removes_its_listeners() {
    let (mut manager, feed, _server) = open_feed(FeedConfig::new()).await;
    let handle = manager.handle();
    assert_eq!(handle.listener_count(), 2);

    drop(feed);
    assert_eq!(handle.listener_count(), 0);

    manager.shutdown().await;
}

#[test]
fn capacity_is_at_least_one() {
    assert_eq!(FeedConfig::new().with_capacity(0).capacity, 1);
    assert_eq!(FeedConfig::default().capacity, 200);
}
