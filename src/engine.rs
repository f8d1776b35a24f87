//! Timer-driven synchronization of scores with the server.
//!
//! [`SyncEngine`] wraps a [`ScoreBoard`] and drives it from three sources:
//!
//! - `UpdateState` snapshots arriving through the [`ConnectionHandle`],
//! - local increments from [`SyncEngine::apply_local_increment`],
//! - its own background task, which runs the animation ticker, flushes the
//!   pending delta as one `AddCount` per flush window and re-declares the
//!   player name on every new connection.
//!
//! All timing uses `tokio::time`, so tests drive it on a paused clock.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::start(connector, ConnectionConfig::new());
//! let engine = SyncEngine::start(
//!     manager.handle(),
//!     Arc::new(MemoryNameStore::new()),
//!     SyncConfig::new(),
//! );
//!
//! engine.set_name("Alice")?;
//! engine.apply_local_increment(1)?;
//! println!("total: {}", engine.totals().interpolated);
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::identity::{normalize_name, NameStore};
use crate::listeners::{listener, Listener};
use crate::protocol::{ClientMessage, MessageKind, PlayerName, Score, ScoreMap, ServerMessage};
use crate::scores::{ScoreBoard, Totals};

/// Default length of the outbound batching window.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// The animation ticker runs this many times per flush window.
const TICKS_PER_FLUSH: u32 = 7;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SyncEngine`].
///
/// # Example
///
/// ```
/// use counter_sync::engine::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new().with_flush_interval(Duration::from_millis(700));
/// assert_eq!(config.animation_tick, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum spacing between two `AddCount` messages. Increments made
    /// inside one window are sent together at its end.
    ///
    /// Defaults to **1000 ms**.
    pub flush_interval: Duration,
    /// Delay between two interpolation steps.
    ///
    /// Defaults to a seventh of the flush interval (~143 ms).
    pub animation_tick: Duration,
    /// Re-apply the unsent local delta on top of incoming snapshots.
    ///
    /// Defaults to `false`: snapshots replace the scores wholesale.
    pub pending_overlay: bool,
    /// Time the background task is given to exit on shutdown.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            animation_tick: DEFAULT_FLUSH_INTERVAL / TICKS_PER_FLUSH,
            pending_overlay: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the flush window. Also resets the animation tick to a seventh of it.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self.animation_tick = interval / TICKS_PER_FLUSH;
        self
    }

    /// Set the delay between interpolation steps.
    #[must_use]
    pub fn with_animation_tick(mut self, tick: Duration) -> Self {
        self.animation_tick = tick;
        self
    }

    /// Enable or disable re-applying the unsent delta to snapshots.
    #[must_use]
    pub fn with_pending_overlay(mut self, enabled: bool) -> Self {
        self.pending_overlay = enabled;
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── View ────────────────────────────────────────────────────────────

/// Everything a presentation layer renders, captured at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameView {
    /// Authoritative scores including optimistic local edits.
    pub state: ScoreMap,
    /// Smoothed scores.
    pub interpolated: ScoreMap,
    pub totals: Totals,
    /// A snapshot (or a local edit) has produced score data.
    pub loaded: bool,
    pub name: Option<PlayerName>,
    /// The connection is open.
    pub ready: bool,
    /// The connection failed and has not recovered yet.
    pub disconnected: bool,
}

impl GameView {
    /// Whether the increment action can be offered to the user.
    pub fn can_play(&self) -> bool {
        self.name.is_some()
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Owner of the score state and its background timers.
///
/// Dropping the engine unregisters its snapshot listener and aborts the
/// background task.
pub struct SyncEngine {
    board: Arc<watch::Sender<ScoreBoard>>,
    store: Arc<dyn NameStore>,
    connection: ConnectionHandle,
    snapshot_listener: Listener,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SyncEngine {
    /// Load the stored name, subscribe to snapshots and spawn the timer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        connection: ConnectionHandle,
        store: Arc<dyn NameStore>,
        config: SyncConfig,
    ) -> Self {
        let mut initial = ScoreBoard::new().with_pending_overlay(config.pending_overlay);
        match store.load() {
            Ok(Some(name)) => {
                debug!(%name, "restored player name");
                initial.set_name(name);
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load player name: {e}"),
        }

        let (board_tx, _) = watch::channel(initial);
        let board = Arc::new(board_tx);

        let snapshot_listener = {
            let board = Arc::clone(&board);
            listener(move |message| {
                if let ServerMessage::UpdateState { new_state } = message {
                    board.send_modify(|b| {
                        let outcome = b.apply_snapshot(new_state.clone());
                        debug!(?outcome, players = new_state.len(), "applied snapshot");
                    });
                }
            })
        };
        connection.add_listener(MessageKind::UpdateState, Arc::clone(&snapshot_listener));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shutdown_timeout = config.shutdown_timeout;
        let task = tokio::spawn(engine_loop(
            Arc::clone(&board),
            connection.clone(),
            config,
            shutdown_rx,
        ));

        Self {
            board,
            store,
            connection,
            snapshot_listener,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        }
    }

    /// Choose (or change) the local player's name.
    ///
    /// The name is persisted and declared to the server right away when the
    /// connection is open; otherwise it is declared as soon as it opens.
    ///
    /// # Errors
    ///
    /// Returns [`CounterSyncError::EmptyName`](crate::CounterSyncError::EmptyName)
    /// for a blank name.
    pub fn set_name(&self, raw: &str) -> Result<()> {
        let name = normalize_name(raw)?;
        let changed = self.board.send_if_modified(|b| b.set_name(name.clone()));
        if !changed {
            return Ok(());
        }
        if let Err(e) = self.store.save(&name) {
            warn!("failed to persist player name: {e}");
        }
        self.connection.send(ClientMessage::SetName { data: name });
        Ok(())
    }

    /// Apply a local increment immediately and queue it for the server.
    ///
    /// # Errors
    ///
    /// Returns [`CounterSyncError::NotReady`](crate::CounterSyncError::NotReady)
    /// if no name has been chosen yet.
    pub fn apply_local_increment(&self, amount: Score) -> Result<()> {
        let mut result = Ok(());
        self.board.send_if_modified(|b| {
            result = b.apply_local_increment(amount);
            result.is_ok()
        });
        result
    }

    /// Feed an authoritative snapshot directly, as if it had arrived on the
    /// connection.
    pub fn apply_snapshot(&self, snapshot: ScoreMap) {
        self.board.send_modify(|b| {
            b.apply_snapshot(snapshot);
        });
    }

    /// The local player's name.
    pub fn name(&self) -> Option<PlayerName> {
        self.board.borrow().name().map(str::to_owned)
    }

    /// Sums of the authoritative and the interpolated scores.
    pub fn totals(&self) -> Totals {
        self.board.borrow().totals()
    }

    /// A copy of the current score state.
    pub fn board(&self) -> ScoreBoard {
        self.board.borrow().clone()
    }

    /// Everything a UI needs, captured now.
    pub fn view(&self) -> GameView {
        let connection = self.connection.state();
        let board = self.board.borrow();
        GameView {
            state: board.server_state().cloned().unwrap_or_default(),
            interpolated: board.interpolated_state().cloned().unwrap_or_default(),
            totals: board.totals(),
            loaded: board.is_loaded(),
            name: board.name().map(str::to_owned),
            ready: connection.is_open(),
            disconnected: connection.disconnected,
        }
    }

    /// Subscribe to score state changes.
    pub fn subscribe(&self) -> watch::Receiver<ScoreBoard> {
        self.board.subscribe()
    }

    /// The connection this engine sends through.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Stop the timers and unsubscribe from snapshots. Unsent increments are
    /// discarded.
    pub async fn shutdown(&mut self) {
        debug!("SyncEngine: shutdown requested");
        self.connection
            .remove_listener(MessageKind::UpdateState, &self.snapshot_listener);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("engine loop did not exit within timeout; aborting task");
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("board", &*self.board.borrow())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.connection
            .remove_listener(MessageKind::UpdateState, &self.snapshot_listener);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Background task ─────────────────────────────────────────────────

async fn engine_loop(
    board: Arc<watch::Sender<ScoreBoard>>,
    connection: ConnectionHandle,
    config: SyncConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("engine loop started");
    let mut board_rx = board.subscribe();
    let mut conn_rx = connection.subscribe();

    let mut announced = 0;
    let state = *conn_rx.borrow_and_update();
    if state.is_open() {
        announced = state.opened;
        announce_name(&board, &connection);
    }

    let mut flush_at: Option<Instant> = None;
    let mut tick_at: Option<Instant> = None;

    loop {
        {
            let current = board_rx.borrow_and_update();
            // Trailing-edge throttle: the window opens with the first unsent
            // increment and later increments ride along.
            if current.pending() != 0 && flush_at.is_none() {
                flush_at = Some(Instant::now() + config.flush_interval);
            }
            if !current.needs_animation() {
                tick_at = None;
            } else if tick_at.is_none() {
                tick_at = Some(Instant::now() + config.animation_tick);
            }
        }

        tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,

            // Ahead of the flush so a new connection hears the name first.
            changed = conn_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *conn_rx.borrow_and_update();
                if state.is_open() && state.opened != announced {
                    announced = state.opened;
                    announce_name(&board, &connection);
                }
            }

            _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                flush_at = None;
                flush(&board, &connection);
            }

            _ = sleep_until(tick_at.unwrap_or_else(Instant::now)), if tick_at.is_some() => {
                tick_at = None;
                board.send_if_modified(ScoreBoard::tick);
            }

            changed = board_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("engine loop exited");
}

/// Declare the current name on a freshly opened connection.
fn announce_name(board: &watch::Sender<ScoreBoard>, connection: &ConnectionHandle) {
    let name = board.borrow().name().map(str::to_owned);
    if let Some(name) = name {
        debug!(%name, "declaring player name");
        connection.send(ClientMessage::SetName { data: name });
    }
}

/// Hand the pending delta to the connection as one `AddCount`. The delta is
/// only cleared when the connection accepts the message.
fn flush(board: &watch::Sender<ScoreBoard>, connection: &ConnectionHandle) {
    if !connection.is_ready() {
        debug!("connection not open, holding pending increments");
        return;
    }
    let mut amount: Score = 0;
    board.send_if_modified(|b| {
        amount = b.take_pending();
        amount != 0
    });
    if amount == 0 {
        return;
    }
    if connection.send(ClientMessage::AddCount { data: amount }) {
        debug!(amount, "flushed pending increments");
    } else {
        board.send_modify(|b| b.restore_pending(amount));
    }
}

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

    #[test]
    fn config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.flush_interval, Duration::from_millis(1000));
        assert_eq!(config.animation_tick, Duration::from_millis(1000) / 7);
        assert!(!config.pending_overlay);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn explicit_animation_tick_overrides_derived_one() {
        let config = SyncConfig::new()
            .with_flush_interval(Duration::from_millis(1400))
            .with_animation_tick(Duration::from_millis(50));
        assert_eq!(config.flush_interval, Duration::from_millis(1400));
        assert_eq!(config.animation_tick, Duration::from_millis(50));
    }

    #[test]
    fn view_can_play_only_with_name() {
        let mut view = GameView {
            state: ScoreMap::new(),
            interpolated: ScoreMap::new(),
            totals: Totals::default(),
            loaded: false,
            name: None,
            ready: true,
            disconnected: false,
        };
        assert!(!view.can_play());
        view.name = Some("Alice".into());
        assert!(view.can_play());
    }
}
