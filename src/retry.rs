//! Bounded-retry driver with exponential backoff and jitter.
//!
//! Every external I/O in the crate goes through either a [`RetryConfig`]
//! (attempt-bounded, used for connection setup) or a [`Deadline`] with the
//! shared resilient schedule (wall-clock-bounded, used for critical writes
//! that must survive a broker or store outage measured in minutes).

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Exponential backoff schedule with optional attempt bound.
///
/// Delay before attempt `n+1` (attempts are 1-indexed) is
/// `min(max_delay, base_delay * multiplier^(n-1))` plus a uniform jitter
/// in `[0, jitter]`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub jitter: Duration,
}

impl RetryConfig {
    /// The connection-establishment schedule shared by the broker and KV
    /// connectors: 5s base, x1.5 growth, 60s cap, unbounded attempts.
    pub fn connect_schedule(jitter: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            jitter,
        }
    }

    /// Cap the schedule at `attempts` attempts.
    pub fn bounded(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Backoff delay after the given 1-indexed attempt, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped) + uniform_jitter(self.jitter)
    }

    /// Run `op` until it returns `Ok`, retrying every `Err` on this
    /// schedule. Returns the last error on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if self.exhausted(attempt) {
                        tracing::error!(%name, attempt, error = %err, "retry attempts exhausted");
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run a boolean effect until it reports success. A `false` result is
    /// retried like a failure. Returns `false` on exhaustion.
    pub async fn run_until<F, Fut>(&self, name: &str, mut op: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if op(attempt).await {
                return true;
            }
            if self.exhausted(attempt) {
                tracing::error!(%name, attempt, "retry attempts exhausted");
                return false;
            }
            let delay = self.delay_for(attempt);
            tracing::debug!(
                %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "condition not met, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Like [`RetryConfig::run`], with a caller-supplied predicate deciding
    /// whether a given outcome is retried. `should_retry` sees the outcome
    /// and the 1-indexed attempt number.
    pub async fn run_where<T, E, F, Fut, P>(
        &self,
        name: &str,
        mut op: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&Result<T, E>, u32) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = op(attempt).await;
            if !should_retry(&outcome, attempt) || self.exhausted(attempt) {
                return outcome;
            }
            let delay = self.delay_for(attempt);
            tracing::debug!(
                %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "predicate requested retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

fn uniform_jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=jitter.as_secs_f64()))
}

/// Delay for attempt `n` of a resilient write: `min(5 * 1.2^min(n-1, 10), 30)`.
pub fn resilient_write_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10) as i32;
    Duration::from_secs_f64((5.0 * 1.2f64.powi(exp)).min(30.0))
}

/// Delay for attempt `n` of a resilient read: `min(2 * 1.2^min(n-1, 5), 15)`.
/// Reads recover faster because a missed read is retried by its caller.
pub fn resilient_read_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5) as i32;
    Duration::from_secs_f64((2.0 * 1.2f64.powi(exp)).min(15.0))
}

/// Wall-clock budget for a resilient operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    max_wait: Duration,
}

impl Deadline {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            started: Instant::now(),
            max_wait,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.max_wait
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleep for `delay`, clipped so the deadline is never overshot by a
    /// full backoff step. Returns `false` when the deadline has expired.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.expired() {
            return false;
        }
        let remaining = self.max_wait.saturating_sub(self.started.elapsed());
        tokio::time::sleep(delay.min(remaining)).await;
        !self.expired()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_schedule(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(8),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            max_attempts: None,
            base_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(5));
        assert_eq!(config.delay_for(2), Duration::from_secs_f64(7.5));
        // Far along the curve the cap wins.
        assert_eq!(config.delay_for(20), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let config = RetryConfig {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            multiplier: 1.0,
            max_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        };
        for _ in 0..100 {
            let d = config.delay_for(1);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let result: Result<u32, &str> = fast_schedule(Some(5))
            .run("test", move |attempt| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 { Err("nope") } else { Ok(attempt) }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_on_exhaustion() {
        let result: Result<(), String> = fast_schedule(Some(3))
            .run("test", |attempt| async move { Err(format!("fail {attempt}")) })
            .await;
        assert_eq!(result, Err("fail 3".to_string()));
    }

    #[tokio::test]
    async fn falsy_results_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let ok = fast_schedule(Some(10))
            .run_until("test", move |attempt| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    attempt >= 4
                }
            })
            .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_until_gives_up_after_bound() {
        let ok = fast_schedule(Some(2))
            .run_until("test", |_| async { false })
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn predicate_controls_retry() {
        // Retry even on Ok until the value is large enough.
        let result: Result<u32, &str> = fast_schedule(Some(10))
            .run_where(
                "test",
                |attempt| async move { Ok(attempt) },
                |outcome, _| !matches!(outcome, Ok(v) if *v >= 3),
            )
            .await;
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn resilient_schedule_matches_contract() {
        assert_eq!(resilient_write_delay(1), Duration::from_secs(5));
        assert_eq!(resilient_write_delay(2), Duration::from_secs_f64(6.0));
        // Exponent is clamped at 10, then the 30s cap applies.
        assert_eq!(resilient_write_delay(11), resilient_write_delay(12));
        assert!(resilient_write_delay(50) <= Duration::from_secs(30));
        assert_eq!(resilient_read_delay(1), Duration::from_secs(2));
        assert!(resilient_read_delay(50) <= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn deadline_expires() {
        tokio::time::pause();
        let deadline = Deadline::new(Duration::from_secs(10));
        assert!(!deadline.expired());
        assert!(deadline.sleep(Duration::from_secs(4)).await);
        assert!(!deadline.sleep(Duration::from_secs(60)).await);
        assert!(deadline.expired());
    }
}
