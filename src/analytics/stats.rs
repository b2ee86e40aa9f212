use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Process-wide counters surfaced to operators via logs and the admin bus.
/// Extended from the swap-detector-only counters of the originating scaffold
/// to cover every job: fast-claim, flywheel, reactive, and the rate limiter.
#[derive(Debug, Default)]
pub struct Stats {
    pub total_swaps_detected: AtomicU64,
    pub successful_trades: AtomicU64,
    pub failed_trades: AtomicU64,

    pub claims_attempted: AtomicU64,
    pub claims_succeeded: AtomicU64,
    pub claims_failed: AtomicU64,

    pub reactive_trades_triggered: AtomicU64,
    pub reactive_trades_dropped_cooldown: AtomicU64,
    pub reactive_trades_dropped_echo: AtomicU64,

    pub breaker_trips: AtomicU64,
    pub breaker_resumes: AtomicU64,
    pub rate_limit_waits: AtomicU64,

    // For latency, the last observed value is kept as a gauge rather than a
    // histogram, matching the scaffold's original simplicity.
    pub last_processing_latency_ms: AtomicU64,
    pub last_trade_latency_ms: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_swaps_detected(&self) {
        self.total_swaps_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_successful_trades(&self) {
        self.successful_trades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_trades(&self) {
        self.failed_trades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_claims_attempted(&self) {
        self.claims_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_claims_succeeded(&self) {
        self.claims_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_claims_failed(&self) {
        self.claims_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reactive_triggered(&self) {
        self.reactive_trades_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reactive_dropped_cooldown(&self) {
        self.reactive_trades_dropped_cooldown
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reactive_dropped_echo(&self) {
        self.reactive_trades_dropped_echo.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_trips(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_resumes(&self) {
        self.breaker_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_waits(&self) {
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_processing_latency(&self, ms: u64) {
        self.last_processing_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn update_trade_latency(&self, ms: u64) {
        self.last_trade_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn log_stats(&self) {
        info!(
            swaps_detected = self.total_swaps_detected.load(Ordering::Relaxed),
            trades_ok = self.successful_trades.load(Ordering::Relaxed),
            trades_failed = self.failed_trades.load(Ordering::Relaxed),
            claims_ok = self.claims_succeeded.load(Ordering::Relaxed),
            claims_failed = self.claims_failed.load(Ordering::Relaxed),
            reactive_triggered = self.reactive_trades_triggered.load(Ordering::Relaxed),
            breaker_trips = self.breaker_trips.load(Ordering::Relaxed),
            proc_latency_ms = self.last_processing_latency_ms.load(Ordering::Relaxed),
            trade_latency_ms = self.last_trade_latency_ms.load(Ordering::Relaxed),
            "engine stats",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stats_concurrency() {
        let stats = Arc::new(Stats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let stats = stats.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    stats.inc_swaps_detected();
                    stats.update_processing_latency(50);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.total_swaps_detected.load(Ordering::Relaxed), 1000);
        assert_eq!(stats.last_processing_latency_ms.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn tracks_claims_and_breaker_counters() {
        let stats = Stats::new();
        stats.inc_claims_attempted();
        stats.inc_claims_succeeded();
        stats.inc_breaker_trips();
        stats.inc_breaker_resumes();

        assert_eq!(stats.claims_attempted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.claims_succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(stats.breaker_trips.load(Ordering::Relaxed), 1);
        assert_eq!(stats.breaker_resumes.load(Ordering::Relaxed), 1);
    }
}
