//! Score reconciliation without timers.
//!
//! [`ScoreBoard`] holds the three pieces of client-side game state: the
//! authoritative scores last received from the server (plus optimistic local
//! edits), the interpolated scores shown to the user, and the local delta not
//! yet sent to the server. Every operation is synchronous; the
//! [`SyncEngine`](crate::engine::SyncEngine) decides *when* to tick and flush.

use crate::error::{CounterSyncError, Result};
use crate::protocol::{PlayerName, Score, ScoreMap};

/// Sums of both score maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Sum of the authoritative (plus optimistic) scores.
    pub server: Score,
    /// Sum of the interpolated scores.
    pub interpolated: Score,
}

/// How a snapshot changed the interpolated view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// First snapshot: adopted verbatim, replacing any view built from
    /// local edits.
    Adopted,
    /// Players joined, left or were replaced: interpolated view snapped to
    /// the snapshot.
    Snapped,
    /// Same players: the local player's entry takes the snapshot value, the
    /// rest is left for the ticker.
    Retargeted,
}

/// Client-side scores for every player.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreBoard {
    name: Option<PlayerName>,
    server: Option<ScoreMap>,
    interpolated: Option<ScoreMap>,
    /// An authoritative snapshot has arrived. Local edits made before that
    /// do not count.
    snapshot_seen: bool,
    pending: Score,
    pending_overlay: bool,
}

impl ScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-apply the unsent local delta on top of every incoming snapshot.
    ///
    /// A snapshot can never contain increments that have not been sent yet,
    /// so without this the local player's score dips until the next flush is
    /// reflected by the server.
    #[must_use]
    pub fn with_pending_overlay(mut self, enabled: bool) -> Self {
        self.pending_overlay = enabled;
        self
    }

    /// The local player's name, if one has been chosen.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the local player's name. Returns `true` if it changed.
    pub fn set_name(&mut self, name: impl Into<PlayerName>) -> bool {
        let name = name.into();
        if self.name.as_ref() == Some(&name) {
            return false;
        }
        self.name = Some(name);
        true
    }

    /// `true` once any score data exists.
    pub fn is_loaded(&self) -> bool {
        self.server.is_some()
    }

    /// Authoritative scores including optimistic local edits.
    pub fn server_state(&self) -> Option<&ScoreMap> {
        self.server.as_ref()
    }

    /// Scores as currently displayed.
    pub fn interpolated_state(&self) -> Option<&ScoreMap> {
        self.interpolated.as_ref()
    }

    /// Local increments not yet handed to the connection.
    pub fn pending(&self) -> Score {
        self.pending
    }

    /// Apply an increment by the local player immediately.
    ///
    /// The authoritative and the interpolated entry for the local player move
    /// together, so the player's own action is never animated. Arithmetic
    /// saturates at the `i64` bounds.
    ///
    /// # Errors
    ///
    /// Returns [`CounterSyncError::NotReady`] if no name has been chosen.
    pub fn apply_local_increment(&mut self, amount: Score) -> Result<()> {
        let name = self.name.as_ref().ok_or(CounterSyncError::NotReady)?;

        for map in [&mut self.server, &mut self.interpolated] {
            let score = map
                .get_or_insert_with(ScoreMap::new)
                .entry(name.clone())
                .or_insert(0);
            *score = score.saturating_add(amount);
        }
        self.pending = self.pending.saturating_add(amount);
        Ok(())
    }

    /// Replace the authoritative scores with `snapshot` and reconcile the
    /// interpolated view.
    ///
    /// The first snapshot is adopted even if local increments created a view
    /// before it. The local player's own interpolated entry always takes the
    /// snapshot value.
    pub fn apply_snapshot(&mut self, mut snapshot: ScoreMap) -> SnapshotOutcome {
        if self.pending_overlay && self.pending != 0 {
            if let Some(name) = &self.name {
                let score = snapshot.entry(name.clone()).or_insert(0);
                *score = score.saturating_add(self.pending);
            }
        }

        let outcome = match &self.interpolated {
            Some(current) if self.snapshot_seen => {
                if current.keys().eq(snapshot.keys()) {
                    SnapshotOutcome::Retargeted
                } else {
                    SnapshotOutcome::Snapped
                }
            }
            _ => SnapshotOutcome::Adopted,
        };
        match outcome {
            SnapshotOutcome::Adopted | SnapshotOutcome::Snapped => {
                self.interpolated = Some(snapshot.clone());
            }
            SnapshotOutcome::Retargeted => {
                if let (Some(name), Some(current)) = (&self.name, self.interpolated.as_mut()) {
                    if let (Some(shown), Some(target)) = (current.get_mut(name), snapshot.get(name)) {
                        *shown = *target;
                    }
                }
            }
        }
        self.snapshot_seen = true;
        self.server = Some(snapshot);
        outcome
    }

    /// `true` while the interpolated view tracks the same players as the
    /// authoritative scores but shows different values.
    pub fn needs_animation(&self) -> bool {
        let (Some(server), Some(interpolated)) = (&self.server, &self.interpolated) else {
            return false;
        };
        if server.len() != interpolated.len() {
            return false;
        }
        let mut distance: Score = 0;
        for (player, target) in server {
            let Some(shown) = interpolated.get(player) else {
                return false;
            };
            distance = distance.saturating_add(target.saturating_sub(*shown).saturating_abs());
        }
        distance != 0
    }

    /// Advance the interpolated view by one animation step.
    ///
    /// Every entry moves by `min(target - shown, 1)`: increases count up one
    /// unit per step, decreases land in a single step (two if the gap exceeds
    /// the `i64` range). Returns `false` (and changes nothing) when no
    /// animation is needed.
    pub fn tick(&mut self) -> bool {
        if !self.needs_animation() {
            return false;
        }
        let (Some(server), Some(interpolated)) = (&self.server, &mut self.interpolated) else {
            return false;
        };
        for (player, shown) in interpolated.iter_mut() {
            if let Some(target) = server.get(player) {
                *shown = shown.saturating_add(target.saturating_sub(*shown).min(1));
            }
        }
        true
    }

    /// Take the unsent delta, leaving zero behind.
    pub fn take_pending(&mut self) -> Score {
        std::mem::take(&mut self.pending)
    }

    /// Put back a delta that could not be handed to the connection.
    pub fn restore_pending(&mut self, amount: Score) {
        self.pending = self.pending.saturating_add(amount);
    }

    /// Sums of both maps; zero for a map that does not exist yet.
    pub fn totals(&self) -> Totals {
        let sum = |map: &Option<ScoreMap>| {
            map.iter()
                .flat_map(|m| m.values())
                .fold(0, |acc: Score, v| acc.saturating_add(*v))
        };
        Totals {
            server: sum(&self.server),
            interpolated: sum(&self.interpolated),
        }
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

    fn scores(entries: &[(&str, Score)]) -> ScoreMap {
        entries
            .iter()
            .map(|(name, score)| (name.to_string(), *score))
            .collect()
    }

    fn named(name: &str) -> ScoreBoard {
        let mut board = ScoreBoard::new();
        board.set_name(name);
        board
    }

    #[test]
    fn increment_without_name_is_rejected() {
        let mut board = ScoreBoard::new();
        let err = board.apply_local_increment(1).unwrap_err();
        assert!(matches!(err, CounterSyncError::NotReady));
        assert_eq!(board.pending(), 0);
        assert!(!board.is_loaded());
    }

    #[test]
    fn first_snapshot_is_adopted() {
        let mut board = ScoreBoard::new();
        let outcome = board.apply_snapshot(scores(&[("A", 3)]));
        assert_eq!(outcome, SnapshotOutcome::Adopted);
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 3)])));
        assert!(board.is_loaded());
    }

    #[test]
    fn same_snapshot_twice_is_idempotent() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 1), ("B", 2)]));
        let once = board.clone();
        board.apply_snapshot(scores(&[("A", 1), ("B", 2)]));
        assert_eq!(board.server_state(), once.server_state());
        assert_eq!(board.interpolated_state(), once.interpolated_state());
    }

    #[test]
    fn interpolation_converges_then_stops() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 0)]));
        assert_eq!(
            board.apply_snapshot(scores(&[("A", 10)])),
            SnapshotOutcome::Retargeted
        );
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 0)])));

        let mut ticks = 0;
        while board.tick() {
            ticks += 1;
            assert!(ticks <= 10, "interpolation did not converge");
        }
        assert_eq!(ticks, 10);
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 10)])));
        assert!(!board.needs_animation());
        assert!(!board.tick());
    }

    #[test]
    fn every_player_advances_one_unit_per_tick() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 0), ("B", 5)]));
        board.apply_snapshot(scores(&[("A", 2), ("B", 8)]));

        assert!(board.tick());
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 1), ("B", 6)])));
        assert!(board.tick());
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 2), ("B", 7)])));
        assert!(board.tick());
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 2), ("B", 8)])));
        assert!(!board.tick());
    }

    #[test]
    fn decrease_lands_in_one_tick() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 9)]));
        board.apply_snapshot(scores(&[("A", 4)]));
        assert!(board.tick());
        assert_eq!(board.interpolated_state(), Some(&scores(&[("A", 4)])));
        assert!(!board.needs_animation());
    }

    #[test]
    fn own_increment_never_lags() {
        let mut board = named("Bob");
        board.apply_snapshot(scores(&[("Bob", 5)]));
        board.apply_local_increment(3).unwrap();

        assert_eq!(board.interpolated_state().unwrap()["Bob"], 8);
        assert_eq!(board.server_state().unwrap()["Bob"], 8);
        assert_eq!(board.pending(), 3);
        assert!(!board.needs_animation());
    }

    #[test]
    fn increment_creates_missing_entry() {
        let mut board = named("Carol");
        board.apply_snapshot(scores(&[("A", 1)]));
        board.apply_local_increment(2).unwrap();
        assert_eq!(board.server_state(), Some(&scores(&[("A", 1), ("Carol", 2)])));
        assert_eq!(
            board.interpolated_state(),
            Some(&scores(&[("A", 1), ("Carol", 2)]))
        );
    }

    #[test]
    fn join_snaps_instead_of_animating() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 1), ("B", 1)]));
        board.apply_snapshot(scores(&[("A", 4), ("B", 1)]));
        board.tick();

        let joined = scores(&[("A", 7), ("B", 2), ("C", 0)]);
        assert_eq!(board.apply_snapshot(joined.clone()), SnapshotOutcome::Snapped);
        assert_eq!(board.interpolated_state(), Some(&joined));
        assert!(!board.needs_animation());
    }

    #[test]
    fn leave_snaps_instead_of_animating() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 1), ("B", 1)]));
        let left = scores(&[("A", 6)]);
        assert_eq!(board.apply_snapshot(left.clone()), SnapshotOutcome::Snapped);
        assert_eq!(board.interpolated_state(), Some(&left));
    }

    #[test]
    fn replaced_player_snaps_instead_of_animating() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", 1)]));
        let replaced = scores(&[("Z", 3)]);
        assert_eq!(board.apply_snapshot(replaced.clone()), SnapshotOutcome::Snapped);
        assert_eq!(board.interpolated_state(), Some(&replaced));
        assert!(!board.needs_animation());
        assert!(!board.tick());
    }

    #[test]
    fn first_snapshot_is_adopted_after_early_increment() {
        let mut board = named("Alice");
        board.apply_local_increment(1).unwrap();
        assert_eq!(board.interpolated_state(), Some(&scores(&[("Alice", 1)])));

        let first = scores(&[("Bob", 3)]);
        assert_eq!(board.apply_snapshot(first.clone()), SnapshotOutcome::Adopted);
        assert_eq!(board.interpolated_state(), Some(&first));
        assert_eq!(board.server_state(), Some(&first));
        assert!(!board.needs_animation());
    }

    #[test]
    fn own_entry_follows_stale_and_catch_up_snapshots() {
        let mut board = named("Bob");
        board.apply_snapshot(scores(&[("Bob", 0)]));
        board.apply_local_increment(5).unwrap();
        assert_eq!(board.take_pending(), 5);

        // Snapshot sent before the server saw the increment.
        board.apply_snapshot(scores(&[("Bob", 0)]));
        assert_eq!(board.interpolated_state().unwrap()["Bob"], 0);
        assert!(!board.tick());

        board.apply_snapshot(scores(&[("Bob", 5)]));
        assert_eq!(board.interpolated_state().unwrap()["Bob"], 5);
        assert_eq!(board.server_state().unwrap()["Bob"], 5);
        assert!(!board.needs_animation());
    }

    #[test]
    fn extreme_scores_saturate_instead_of_overflowing() {
        let mut board = ScoreBoard::new();
        board.apply_snapshot(scores(&[("A", -5)]));
        assert_eq!(
            board.apply_snapshot(scores(&[("A", Score::MAX)])),
            SnapshotOutcome::Retargeted
        );
        assert!(board.needs_animation());
        assert!(board.tick());
        assert_eq!(board.interpolated_state().unwrap()["A"], -4);

        board.apply_snapshot(scores(&[("A", Score::MIN)]));
        assert!(board.tick());
        assert_eq!(board.interpolated_state().unwrap()["A"], Score::MIN);

        board.apply_snapshot(scores(&[("A", Score::MAX)]));
        assert!(board.tick());
        assert_eq!(board.interpolated_state().unwrap()["A"], Score::MIN + 1);

        // A gap wider than the i64 range needs two steps to land.
        board.apply_snapshot(scores(&[("A", Score::MAX), ("B", 0)]));
        board.apply_snapshot(scores(&[("A", Score::MIN), ("B", 0)]));
        assert!(board.tick());
        assert!(board.tick());
        assert_eq!(board.interpolated_state().unwrap()["A"], Score::MIN);
        assert!(!board.tick());

        board.apply_snapshot(scores(&[("A", Score::MAX), ("B", Score::MAX), ("C", 1)]));
        assert_eq!(
            board.totals(),
            Totals {
                server: Score::MAX,
                interpolated: Score::MAX,
            }
        );
    }

    #[test]
    fn own_increment_saturates_at_the_bounds() {
        let mut board = named("A");
        board.apply_snapshot(scores(&[("A", Score::MAX - 1)]));
        board.apply_local_increment(5).unwrap();
        board.apply_local_increment(Score::MAX).unwrap();
        assert_eq!(board.server_state().unwrap()["A"], Score::MAX);
        assert_eq!(board.interpolated_state().unwrap()["A"], Score::MAX);
        assert_eq!(board.pending(), Score::MAX);

        board.restore_pending(Score::MAX);
        assert_eq!(board.pending(), Score::MAX);
    }

    #[test]
    fn snapshot_overwrites_unsent_increment_by_default() {
        let mut board = named("Alice");
        board.apply_snapshot(scores(&[("Alice", 0), ("Bob", 0)]));
        board.apply_local_increment(2).unwrap();

        board.apply_snapshot(scores(&[("Alice", 0), ("Bob", 1)]));
        assert_eq!(board.server_state().unwrap()["Alice"], 0);
        assert_eq!(board.pending(), 2);
    }

    #[test]
    fn pending_overlay_keeps_unsent_increment() {
        let mut board = named("Alice").with_pending_overlay(true);
        board.apply_snapshot(scores(&[("Alice", 0), ("Bob", 0)]));
        board.apply_local_increment(2).unwrap();

        board.apply_snapshot(scores(&[("Alice", 0), ("Bob", 1)]));
        assert_eq!(board.server_state(), Some(&scores(&[("Alice", 2), ("Bob", 1)])));
        assert!(board.tick());
        assert_eq!(
            board.interpolated_state(),
            Some(&scores(&[("Alice", 2), ("Bob", 1)]))
        );
    }

    #[test]
    fn take_and_restore_pending() {
        let mut board = named("Alice");
        board.apply_local_increment(4).unwrap();
        assert_eq!(board.take_pending(), 4);
        assert_eq!(board.pending(), 0);
        board.restore_pending(4);
        board.apply_local_increment(1).unwrap();
        assert_eq!(board.pending(), 5);
    }

    #[test]
    fn totals_sum_both_maps() {
        let mut board = named("Alice");
        assert_eq!(board.totals(), Totals::default());

        board.apply_snapshot(scores(&[("Alice", 0), ("Bob", 0)]));
        board.apply_snapshot(scores(&[("Alice", 0), ("Bob", 4)]));
        board.apply_local_increment(5).unwrap();

        assert_eq!(
            board.totals(),
            Totals {
                server: 9,
                interpolated: 5,
            }
        );
    }

    #[test]
    fn set_name_reports_changes() {
        let mut board = ScoreBoard::new();
        assert!(board.set_name("Alice"));
        assert!(!board.set_name("Alice"));
        assert!(board.set_name("Bob"));
        assert_eq!(board.name(), Some("Bob"));
    }
}
