//! Per-connection request-rate limiting using a token bucket.
//!
//! Guards the API server against a client flooding malformed or
//! well-formed JSON lines. This is an ambient robustness concern, not a
//! protocol feature: a client sending within the burst allowance never
//! observes any effect.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A requests-per-second limit with a burst allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestRateLimit {
    pub requests_per_second: f64,
    pub burst: f64,
}

impl RequestRateLimit {
    pub fn new(requests_per_second: f64, burst: Option<f64>) -> Self {
        Self {
            requests_per_second,
            burst: burst.unwrap_or(requests_per_second),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RequestRateLimit) -> Self {
        Self {
            tokens: limit.burst,
            max_tokens: limit.burst,
            refill_rate: limit.requests_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + self.refill_rate * elapsed).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, count: f64) -> bool {
        self.refill();
        if self.tokens >= count {
            self.tokens -= count;
            true
        } else {
            false
        }
    }

    fn wait_time(&mut self, count: f64) -> Duration {
        self.refill();
        if self.tokens >= count {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((count - self.tokens) / self.refill_rate)
        }
    }
}

/// Per-connection request limiter. One instance per API connection.
#[derive(Debug)]
pub struct RequestRateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RequestRateLimiter {
    pub fn new(limit: RequestRateLimit) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(limit)),
        }
    }

    /// Try to admit one request. Consumes a token on success.
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_consume(1.0)
    }

    /// How long the caller should wait before the next request would be admitted.
    pub async fn wait_time(&self) -> Duration {
        self.bucket.lock().await.wait_time(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_allowance_is_consumed_then_refused() {
        let limiter = RequestRateLimiter::new(RequestRateLimit::new(1.0, Some(2.0)));
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert!(limiter.wait_time().await > Duration::ZERO);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = RequestRateLimiter::new(RequestRateLimit::new(1000.0, Some(1.0)));
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(limiter.try_acquire().await);
    }
}
