#![no_main]

use counter_sync::protocol::ScoreMap;
use counter_sync::scores::ScoreBoard;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Interpret the input as a sequence of operations on one board. The
    // animation must always reach its target in a bounded number of ticks.
    let mut board = ScoreBoard::new();
    board.set_name("self");

    for chunk in data.chunks(3) {
        let [op, a, b] = *chunk else { break };
        match op % 3 {
            0 => {
                let _ = board.apply_local_increment(i64::from(a as i8));
            }
            1 => {
                let snapshot: ScoreMap = (0..(a % 4))
                    .map(|i| (format!("p{i}"), i64::from(b) + i64::from(i)))
                    .collect();
                board.apply_snapshot(snapshot);
            }
            _ => {
                board.tick();
            }
        }
        // The local player's own entry never lags.
        if let (Some(server), Some(shown)) = (board.server_state(), board.interpolated_state()) {
            assert_eq!(server.get("self"), shown.get("self"));
        }
    }

    let mut ticks = 0u64;
    while board.tick() {
        ticks += 1;
        assert!(ticks <= 1 << 20, "interpolation did not converge");
    }
    assert!(!board.needs_animation());
});
