//! The process-wide swap rate limiter described in 4.5 and 5: a single
//! shared token bucket, one refill per minute back to full capacity, FIFO
//! ordering of waiters. Claims are metered separately (by the fast-claim
//! engine's own concurrency cap, not this bucket).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

struct Inner {
    tokens: u32,
    capacity: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A shared, cloneable handle to the bucket. Cloning is cheap (`Arc`); every
/// clone refers to the same underlying counter and waiter queue.
#[derive(Clone)]
pub struct RateLimitBucket {
    inner: Arc<Mutex<Inner>>,
}

impl RateLimitBucket {
    /// Spawns the background refill task and returns the bucket handle.
    /// `capacity` is `turbo.rateLimitPerMin` (or the simple-mode default).
    pub fn spawn(capacity: u32) -> Self {
        let bucket = Self {
            inner: Arc::new(Mutex::new(Inner {
                tokens: capacity,
                capacity,
                waiters: VecDeque::new(),
            })),
        };

        let refill_handle = bucket.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                refill_handle.refill();
            }
        });

        bucket
    }

    fn refill(&self) {
        let mut guard = self.inner.lock();
        guard.tokens = guard.capacity;
        let mut released = 0u32;
        while guard.tokens > 0 {
            let Some(waiter) = guard.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                guard.tokens -= 1;
                released += 1;
            }
        }
        debug!(released, remaining = guard.tokens, "rate limit bucket refilled");
    }

    /// Waits for (and consumes) one token. Never drops the caller's turn:
    /// if the bucket is empty, the caller queues FIFO for the next refill.
    pub async fn acquire(&self) {
        let rx = {
            let mut guard = self.inner.lock();
            if guard.tokens > 0 {
                guard.tokens -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                guard.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            // The sender side only ever fires from `refill`, so a dropped
            // sender (bucket torn down) is not an error path worth surfacing.
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_up_to_capacity_without_blocking() {
        let bucket = RateLimitBucket::spawn(3);
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(50), bucket.acquire())
                .await
                .expect("should not block within capacity");
        }
    }

    #[tokio::test]
    async fn queues_fifo_beyond_capacity() {
        let bucket = RateLimitBucket::spawn(1);
        bucket.acquire().await;

        let bucket2 = bucket.clone();
        let waiter = tokio::spawn(async move {
            bucket2.acquire().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        bucket.refill();
        waiter.await.unwrap();
    }
}
