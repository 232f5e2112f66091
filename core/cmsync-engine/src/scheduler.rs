//! Request scheduler.
//!
//! Every remote call goes through one shared [`Scheduler`]. Calls run
//! strictly one at a time, in submission order, and each start is gated by:
//! - a minimum spacing since the previous start, and
//! - a token bucket of fixed capacity refilled one token per interval.
//!
//! The gate state lives behind a `tokio::sync::Mutex`, which hands out the
//! lock in FIFO order. The lock is held for the whole operation, so the
//! check-and-decrement of tokens and the operation itself are never
//! interleaved with another caller.

use crate::config::RateLimitConfig;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

#[derive(Debug)]
struct Gate {
    tokens: u32,
    last_refill: Option<Instant>,
    last_start: Option<Instant>,
}

impl Gate {
    fn refill(&mut self, now: Instant, capacity: u32, interval: Duration) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };

        if self.tokens >= capacity {
            // A full bucket does not bank time.
            self.last_refill = Some(now);
            return;
        }

        let elapsed = now.saturating_duration_since(last);
        let earned = (elapsed.as_nanos() / interval.as_nanos()) as u64;
        if earned == 0 {
            return;
        }

        let tokens = (u64::from(self.tokens) + earned).min(u64::from(capacity)) as u32;
        self.tokens = tokens;
        self.last_refill = if tokens >= capacity {
            Some(now)
        } else {
            Some(last + interval * earned as u32)
        };
    }

    fn wait_time(&self, now: Instant, interval: Duration, min_interval: Duration) -> Duration {
        let token_wait = match (self.tokens, self.last_refill) {
            (0, Some(last)) => (last + interval).saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        let spacing_wait = self
            .last_start
            .map(|start| (start + min_interval).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        token_wait.max(spacing_wait)
    }
}

/// Serializes remote calls under the CMS rate limit.
#[derive(Debug)]
pub struct Scheduler {
    config: RateLimitConfig,
    gate: Mutex<Gate>,
    executed: AtomicU64,
    throttled: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            bucket_capacity: config.bucket_capacity.max(1),
            ..config
        };
        Self {
            gate: Mutex::new(Gate {
                tokens: config.bucket_capacity,
                last_refill: None,
                last_start: None,
            }),
            config,
            executed: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of operations started so far.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Number of times a caller had to wait for the gate.
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Runs `operation` after every previously scheduled operation has
    /// finished and the rate limit allows another start.
    ///
    /// The operation's output, including any error, is returned unchanged.
    pub async fn schedule<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let capacity = self.config.bucket_capacity;
        let interval = self.config.refill_interval();
        let min_interval = self.config.min_interval();

        let mut gate = self.gate.lock().await;
        loop {
            let now = Instant::now();
            gate.refill(now, capacity, interval);
            let wait = gate.wait_time(now, interval, min_interval);
            if wait.is_zero() {
                break;
            }
            self.throttled.fetch_add(1, Ordering::Relaxed);
            trace!(wait_ms = wait.as_millis() as u64, tokens = gate.tokens, "scheduler waiting");
            sleep(wait).await;
        }

        gate.tokens -= 1;
        gate.last_start = Some(Instant::now());
        self.executed.fetch_add(1, Ordering::Relaxed);

        let output = operation.await;
        drop(gate);
        output
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_does_not_bank_time() {
        let start = Instant::now();
        let mut gate = Gate {
            tokens: 3,
            last_refill: Some(start),
            last_start: None,
        };
        gate.refill(start + Duration::from_secs(10), 3, Duration::from_secs(1));
        assert_eq!(gate.tokens, 3);
        assert_eq!(gate.last_refill, Some(start + Duration::from_secs(10)));
    }

    #[test]
    fn partial_refill_keeps_remainder() {
        let start = Instant::now();
        let mut gate = Gate {
            tokens: 0,
            last_refill: Some(start),
            last_start: None,
        };
        gate.refill(start + Duration::from_millis(2_500), 5, Duration::from_secs(1));
        assert_eq!(gate.tokens, 2);
        assert_eq!(gate.last_refill, Some(start + Duration::from_secs(2)));
    }

    #[test]
    fn empty_bucket_waits_for_next_token() {
        let start = Instant::now();
        let gate = Gate {
            tokens: 0,
            last_refill: Some(start),
            last_start: None,
        };
        let wait = gate.wait_time(
            start + Duration::from_millis(400),
            Duration::from_secs(1),
            Duration::ZERO,
        );
        assert_eq!(wait, Duration::from_millis(600));
    }

    #[test]
    fn spacing_wait_dominates_when_longer() {
        let start = Instant::now();
        let gate = Gate {
            tokens: 4,
            last_refill: Some(start),
            last_start: Some(start),
        };
        let wait = gate.wait_time(
            start + Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_millis(250),
        );
        assert_eq!(wait, Duration::from_millis(150));
    }
}
