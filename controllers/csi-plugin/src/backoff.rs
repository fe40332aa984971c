//! # Exponential Backoff
//!
//! Retry pacing for cache waits, node registration and the import flow.
//! Each interval is the previous one times the multiplier, randomized by a
//! fraction either way and capped. An optional total bound stops the
//! sequence once that much time has elapsed since the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    randomization: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
    current: Duration,
    started: Instant,
}

impl Default for ExponentialBackoff {
    /// 1s initial, x1.414, 10% jitter, 5s cap, unbounded
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.414, 0.1, Duration::from_secs(5))
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, multiplier: f64, randomization: f64, max_interval: Duration) -> Self {
        Self {
            initial,
            multiplier,
            randomization,
            max_interval,
            max_elapsed: None,
            current: initial,
            started: Instant::now(),
        }
    }

    /// Stop producing intervals once `max_elapsed` has passed
    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Next wait, or `None` when the total bound is spent
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(limit) = self.max_elapsed {
            if self.started.elapsed() >= limit {
                return None;
            }
        }

        let base = self.current.as_secs_f64();
        let delta = base * self.randomization;
        let jittered = if delta > 0.0 {
            rand::thread_rng().gen_range(base - delta..=base + delta)
        } else {
            base
        };

        let next = (base * self.multiplier).min(self.max_interval.as_secs_f64());
        self.current = Duration::from_secs_f64(next);
        Some(Duration::from_secs_f64(jittered).min(self.max_interval))
    }

    /// Restart the sequence and the elapsed clock
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.started = Instant::now();
    }
}

/// Run `op` until it succeeds, a permanent error occurs or the backoff is spent.
///
/// `retryable` decides which errors are worth another attempt. The last
/// error is returned when the sequence ends.
pub async fn retry<T, E, F, Fut, P>(mut backoff: ExponentialBackoff, what: &str, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    backoff.reset();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => match backoff.next_backoff() {
                Some(wait) => {
                    debug!(operation = %what, error = %e, wait_ms = wait.as_millis() as u64, "Retrying");
                    tokio::time::sleep(wait).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_intervals_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), 1.414, 0.0, Duration::from_secs(5));
        let waits: Vec<u128> = (0..7).map(|_| backoff.next_backoff().expect("unbounded").as_millis()).collect();
        assert_eq!(waits[0], 1000);
        assert!((1410..=1415).contains(&waits[1]));
        assert!((1990..=2010).contains(&waits[2]));
        assert_eq!(*waits.last().expect("waits"), 5000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::default();
        for _ in 0..50 {
            let wait = backoff.next_backoff().expect("unbounded");
            assert!(wait >= Duration::from_millis(900));
            assert!(wait <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_bound_ends_the_sequence() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry(
            ExponentialBackoff::default().with_max_elapsed(Duration::from_secs(10)),
            "test",
            |_| true,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("still missing".to_string())
            },
        )
        .await;
        assert_eq!(result, Err("still missing".to_string()));
        let calls = calls.load(Ordering::SeqCst);
        assert!((4..=8).contains(&calls), "{calls} attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry(
            ExponentialBackoff::default(),
            "test",
            |e: &String| e != "fatal",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
