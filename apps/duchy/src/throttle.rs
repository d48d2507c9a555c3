//! # Throttling
//!
//! Polling loops call [`MinimumIntervalThrottler::ready`] before each
//! attempt, which keeps attempts at least one interval apart.

use std::time::Duration;
use tokio::time::Instant;

/// Cooperative rate limiter: waits out whatever remains of the interval
/// since the previous attempt.
#[derive(Debug)]
pub struct MinimumIntervalThrottler {
    interval: Duration,
    last_attempt: Option<Instant>,
}

impl MinimumIntervalThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_attempt: None,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until an attempt is allowed, then record it.
    pub async fn ready(&mut self) {
        if let Some(last) = self.last_attempt {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_attempt = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_attempt_is_immediate() {
        let mut throttler = MinimumIntervalThrottler::new(Duration::from_secs(5));
        let start = Instant::now();
        throttler.ready().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_spaced_by_the_interval() {
        let mut throttler = MinimumIntervalThrottler::new(Duration::from_millis(100));
        let start = Instant::now();
        throttler.ready().await;
        throttler.ready().await;
        throttler.ready().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
