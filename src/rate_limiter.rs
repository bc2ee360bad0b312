//! Rate limiting for venue calls.
//!
//! Two interchangeable strategies: a token bucket (continuous refill, allows
//! bursts) and a sliding window (hard cap per window). Both are advisory —
//! callers must consult them before every venue call; nothing at the venue
//! client boundary enforces them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter: `max_tokens` capacity refilled continuously at
/// `refill_rate` tokens/second.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenBucketStatus {
    pub tokens_available: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub utilization: f64,
}

impl TokenBucketRateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire `n` tokens if available. Never blocks.
    pub async fn try_acquire(&self, n: f64) -> bool {
        let mut state = self.state.lock().await;
        Self::refill(&mut state, self.max_tokens, self.refill_rate);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Sleep until `n` tokens can be acquired, then acquire them.
    pub async fn await_tokens(&self, n: f64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                Self::refill(&mut state, self.max_tokens, self.refill_rate);
                if state.tokens >= n {
                    state.tokens -= n;
                    return;
                }
                (n - state.tokens) / self.refill_rate
            };
            debug!(wait_secs = wait, tokens_needed = n, "waiting for rate limit tokens");
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.01))).await;
        }
    }

    pub async fn status(&self) -> TokenBucketStatus {
        let mut state = self.state.lock().await;
        Self::refill(&mut state, self.max_tokens, self.refill_rate);
        TokenBucketStatus {
            tokens_available: state.tokens,
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
            utilization: if self.max_tokens > 0.0 {
                (self.max_tokens - state.tokens) / self.max_tokens
            } else {
                0.0
            },
        }
    }

    fn refill(state: &mut BucketState, max_tokens: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * refill_rate).min(max_tokens);
            state.last_refill = now;
        }
    }
}

/// Sliding window limiter: at most `max_requests` admissions in any
/// `window_size` interval.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    max_requests: usize,
    window_size: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlidingWindowStatus {
    pub requests_in_window: usize,
    pub max_requests: usize,
    pub window_secs: f64,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_requests: usize, window_size: Duration) -> Self {
        Self {
            max_requests,
            window_size,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Admit one request if the window has room. Never blocks.
    pub async fn try_acquire(&self) -> bool {
        let mut requests = self.requests.lock().await;
        let now = Instant::now();
        Self::evict(&mut requests, now, self.window_size);
        if requests.len() < self.max_requests {
            requests.push_back(now);
            true
        } else {
            false
        }
    }

    /// Sleep until a slot opens, then take it.
    pub async fn await_slot(&self) {
        loop {
            let wait = {
                let mut requests = self.requests.lock().await;
                let now = Instant::now();
                Self::evict(&mut requests, now, self.window_size);
                if requests.len() < self.max_requests {
                    requests.push_back(now);
                    return;
                }
                let oldest = requests[0];
                self.window_size
                    .checked_sub(now.duration_since(oldest))
                    .unwrap_or(Duration::from_millis(10))
            };
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    pub async fn status(&self) -> SlidingWindowStatus {
        let mut requests = self.requests.lock().await;
        Self::evict(&mut requests, Instant::now(), self.window_size);
        SlidingWindowStatus {
            requests_in_window: requests.len(),
            max_requests: self.max_requests,
            window_secs: self.window_size.as_secs_f64(),
        }
    }

    fn evict(requests: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = requests.front() {
            if now.duration_since(*front) >= window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_drains_and_refills() {
        let limiter = TokenBucketRateLimiter::new(2.0, 40.0);
        assert!(limiter.try_acquire(1.0).await);
        assert!(limiter.try_acquire(1.0).await);
        // Immediately after draining there may be a sliver from refill, but
        // not two whole tokens.
        assert!(!limiter.try_acquire(2.0).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.try_acquire(2.0).await);
    }

    #[tokio::test]
    async fn bucket_never_exceeds_capacity() {
        let limiter = TokenBucketRateLimiter::new(3.0, 1000.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = limiter.status().await;
        assert!(status.tokens_available <= 3.0);
    }

    #[tokio::test]
    async fn await_tokens_blocks_until_refill() {
        let limiter = TokenBucketRateLimiter::new(1.0, 50.0);
        assert!(limiter.try_acquire(1.0).await);
        let start = Instant::now();
        limiter.await_tokens(1.0).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn sliding_window_caps_admissions() {
        let limiter = SlidingWindowRateLimiter::new(3, Duration::from_millis(100));
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn sliding_window_await_slot_eventually_admits() {
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_millis(30));
        assert!(limiter.try_acquire().await);
        limiter.await_slot().await;
        let status = limiter.status().await;
        assert_eq!(status.requests_in_window, 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_respect_capacity() {
        use std::sync::Arc;
        let limiter = Arc::new(TokenBucketRateLimiter::new(5.0, 0.001));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.try_acquire(1.0).await }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
