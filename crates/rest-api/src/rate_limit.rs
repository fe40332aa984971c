//! Token bucket limiter for high-volume routes
//!
//! Requests beyond the burst reserve a future token and wait for it. A
//! request whose reservation would wait longer than the configured maximum
//! is rejected with 429 instead, so nothing is dropped without an answer.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ApiError;

/// Default sustained rate for node publication updates, per second.
pub const DEFAULT_PUBLICATION_RATE: u32 = 10_000;

/// Default burst for node publication updates.
pub const DEFAULT_PUBLICATION_BURST: u32 = 10_000;

/// Default longest a request may wait for a token.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// Token bucket shared by every request on a route
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    max_wait: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Bucket refilled at `rate` tokens per second, holding at most `burst`
    pub fn new(rate: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: f64::from(rate.max(1)),
            burst,
            max_wait: DEFAULT_MAX_WAIT,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                updated: Instant::now(),
            }),
        }
    }

    /// Limiter with the publication defaults
    pub fn for_publications() -> Self {
        Self::new(DEFAULT_PUBLICATION_RATE, DEFAULT_PUBLICATION_BURST)
    }

    /// Longest a request may wait before it is rejected
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Reserve one token.
    ///
    /// Returns how long the caller must wait before proceeding, or `None`
    /// when that wait exceeds the maximum; a refused reservation takes no
    /// token.
    pub async fn reserve(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.updated = now;

        let remaining = bucket.tokens - 1.0;
        let wait = if remaining >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-remaining / self.rate)
        };
        if wait > self.max_wait {
            return None;
        }
        bucket.tokens = remaining;
        Some(wait)
    }

    /// Wait for a token; false when the request should be rejected
    pub async fn acquire(&self) -> bool {
        match self.reserve().await {
            Some(wait) if wait.is_zero() => true,
            Some(wait) => {
                tokio::time::sleep(wait).await;
                true
            }
            None => false,
        }
    }
}

/// Middleware admitting requests through the limiter
pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Response {
    if limiter.acquire().await {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "Rate limit exceeded");
        ApiError::TooManyRequests.into_response()
    }
}
