//! Pure flywheel cycle-state transitions (4.5's state machine plus the §8
//! literal scenarios S1 and S6), kept free of any I/O so they can be tested
//! as plain data transformations independent of `FlywheelScheduler`.

use std::time::Duration;

use crate::model::{FlywheelState, Phase};
use crate::utils::time::exp_backoff;

const BREAKER_THRESHOLD: u32 = 5;
const COOLDOWN_BASE: Duration = Duration::from_secs(60);
const COOLDOWN_CAP: Duration = Duration::from_secs(15 * 60);

/// Applies a successful trade: advances the active phase's counter and,
/// once it reaches the configured cap, flips phase and zeroes both
/// counters to start the new leg clean. On a 5/5 config, ten consecutive
/// successes produce five buys then five sells (S1).
pub fn record_success(state: &mut FlywheelState, cycle_buys: u32, cycle_sells: u32, now: i64) {
    state.consecutive_failures = 0;
    state.last_trade_at = now;

    match state.phase {
        Phase::Buying => {
            state.buy_count += 1;
            if state.buy_count >= cycle_buys.max(1) {
                state.phase = Phase::Selling;
                state.buy_count = 0;
                state.sell_count = 0;
            }
        }
        Phase::Selling => {
            state.sell_count += 1;
            if state.sell_count >= cycle_sells.max(1) {
                state.phase = Phase::Buying;
                state.buy_count = 0;
                state.sell_count = 0;
            }
        }
    }
}

/// Applies a failed attempt: bumps the consecutive-failure streak, sets an
/// exponential cooldown off that streak, and opens the breaker once the
/// streak reaches `BREAKER_THRESHOLD` (S6: five consecutive exhaustions
/// trip it).
pub fn record_failure(state: &mut FlywheelState, now: i64) {
    state.consecutive_failures += 1;
    // exp_backoff's exponent is 0-based (2^attempt); the formula is
    // min(60s * 2^(n-1), 15min) for the n-th consecutive failure.
    let backoff = exp_backoff(state.consecutive_failures - 1, COOLDOWN_BASE, COOLDOWN_CAP);
    state.cooldown_until = now + backoff.as_secs() as i64;

    if state.consecutive_failures >= BREAKER_THRESHOLD {
        state.breaker_opened_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_cycle_runs_five_buys_then_five_sells() {
        let mut state = FlywheelState::new("t1");

        for i in 1..=5u32 {
            record_success(&mut state, 5, 5, i as i64);
            let expected = if i < 5 { i } else { 0 };
            assert_eq!(state.buy_count, expected);
        }
        assert_eq!(state.phase, Phase::Selling);
        assert_eq!(state.sell_count, 0);

        for i in 1..=5u32 {
            record_success(&mut state, 5, 5, 100 + i as i64);
            let expected = if i < 5 { i } else { 0 };
            assert_eq!(state.sell_count, expected);
        }
        assert_eq!(state.phase, Phase::Buying);
        assert_eq!(state.buy_count, 0);
    }

    #[test]
    fn five_consecutive_failures_open_breaker() {
        let mut state = FlywheelState::new("t1");
        for i in 1..=4i64 {
            record_failure(&mut state, i);
            assert!(!state.is_breaker_open());
        }
        record_failure(&mut state, 5);
        assert!(state.is_breaker_open());
        assert_eq!(state.breaker_opened_at, Some(5));
    }

    #[test]
    fn cooldown_doubles_from_the_base_per_failure() {
        let mut state = FlywheelState::new("t1");
        record_failure(&mut state, 0);
        assert_eq!(state.cooldown_until, 60);
        record_failure(&mut state, 0);
        assert_eq!(state.cooldown_until, 120);
        record_failure(&mut state, 0);
        assert_eq!(state.cooldown_until, 240);
        record_failure(&mut state, 0);
        assert_eq!(state.cooldown_until, 480);
    }

    #[test]
    fn cooldown_caps_at_fifteen_minutes() {
        let mut state = FlywheelState::new("t1");
        for _ in 0..10 {
            record_failure(&mut state, 0);
        }
        assert_eq!(state.cooldown_until, 15 * 60);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut state = FlywheelState::new("t1");
        record_failure(&mut state, 1);
        record_failure(&mut state, 2);
        assert_eq!(state.consecutive_failures, 2);
        record_success(&mut state, 5, 5, 3);
        assert_eq!(state.consecutive_failures, 0);
    }
}
