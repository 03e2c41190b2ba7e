//! Bounded retry with exponential backoff.
//!
//! Every reconnect path (setup, health verification, config push) goes
//! through [`Backoff::retry_within`], so the retry policy lives in one place
//! and only the final failure is reported to the caller.

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failed attempt
    pub initial: Duration,
    /// Upper bound for a single delay
    pub max: Duration,
    /// Multiplier applied after each failure
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl Backoff {
    /// Delay to wait after `attempt` failures (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.factor).min(self.max);
        }
        delay.min(self.max)
    }

    /// Runs `op` until it succeeds or `budget` is spent.
    ///
    /// The first attempt always runs. A retry is only scheduled when its
    /// delay still fits in the remaining budget; otherwise the last error is
    /// returned.
    pub async fn retry_within<T, E, F, Fut>(&self, budget: Duration, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = self.delay(attempt);
                    if started.elapsed() + delay > budget {
                        return Err(e);
                    }
                    debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_delay_growth_is_capped() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            factor: 2,
        };

        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = Backoff::default()
            .retry_within(Duration::from_secs(60), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(assert_ok!(result), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_when_budget_spent() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        // 1s + 2s + 4s fit in 10s, the next 8s delay does not
        let result: Result<(), String> = Backoff::default()
            .retry_within(Duration::from_secs(10), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {}", attempt)) }
            })
            .await;

        assert_eq!(assert_err!(result), "attempt 4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = Backoff::default()
            .retry_within(Duration::ZERO, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
