use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the epoch, the unit `cooldown_until`/`breaker_opened_at`
/// and the history records are stamped in.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn now_instant() -> Instant {
    Instant::now()
}

pub fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

pub fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

/// Exponential backoff capped at `cap`, as used by the executor's retry
/// sleep (`min(2^a * base, cap)`) and the scheduler's cooldown
/// (`min(60s * 2^(n-1), 15min)`).
pub fn exp_backoff(attempt: u32, base: std::time::Duration, cap: std::time::Duration) -> std::time::Duration {
    let factor = 2u64.saturating_pow(attempt.min(32));
    base.saturating_mul(factor as u32).min(cap)
}

