use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct BucketState {
    request_bucket: f64,
    token_bucket: f64,
    last_update: Instant,
}

/// Token-bucket rate limiter with separate request and token budgets.
///
/// Callers serialize through `wait_if_needed`; the internal mutex is held
/// across the sleep so waiting requests drain in arrival order. Buckets may
/// go transiently negative when a single request asks for more tokens than
/// capacity; the next request stalls until they refill.
pub struct RateLimiter {
    requests_per_minute: f64,
    tokens_per_minute: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests_per_minute: requests_per_minute as f64,
            tokens_per_minute: tokens_per_minute as f64,
            state: Mutex::new(BucketState {
                request_bucket: requests_per_minute as f64,
                token_bucket: tokens_per_minute as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Sleeps until the buckets can cover one request of `tokens` tokens,
    /// then consumes from both.
    pub async fn wait_if_needed(&self, tokens: usize) {
        let tokens = tokens as f64;
        let mut state = self.state.lock().await;

        self.refill(&mut state);

        let mut wait_secs = 0.0f64;
        if state.request_bucket < 1.0 {
            let request_wait = (1.0 - state.request_bucket) / self.requests_per_minute * 60.0;
            wait_secs = wait_secs.max(request_wait);
        }
        if state.token_bucket < tokens {
            let token_wait = (tokens - state.token_bucket) / self.tokens_per_minute * 60.0;
            wait_secs = wait_secs.max(token_wait);
        }

        if wait_secs > 0.0 {
            debug!(wait_secs, "rate limit reached, backing off");
            tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
            self.refill(&mut state);
        }

        state.request_bucket -= 1.0;
        state.token_bucket -= tokens;
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update);
        if elapsed > Duration::ZERO {
            let minutes = elapsed.as_secs_f64() / 60.0;
            state.request_bucket = (state.request_bucket + minutes * self.requests_per_minute)
                .min(self.requests_per_minute);
            state.token_bucket = (state.token_bucket + minutes * self.tokens_per_minute)
                .min(self.tokens_per_minute);
            state.last_update = now;
        }
    }

    /// Current (request, token) bucket levels, for inspection.
    pub async fn levels(&self) -> (f64, f64) {
        let state = self.state.lock().await;
        (state.request_bucket, state.token_bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Instant;

    #[tokio::test]
    async fn full_bucket_consumes_without_waiting() {
        let limiter = RateLimiter::new(60, 1000);
        let start = Instant::now();
        limiter.wait_if_needed(500).await;
        assert!(start.elapsed() < Duration::from_millis(50));

        let (requests, tokens) = limiter.levels().await;
        assert_relative_eq!(requests, 59.0, max_relative = 0.01);
        assert_relative_eq!(tokens, 500.0, max_relative = 0.01);
    }

    #[tokio::test]
    async fn exact_capacity_request_does_not_wait() {
        let limiter = RateLimiter::new(60, 1000);
        let start = Instant::now();
        limiter.wait_if_needed(1000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_drives_bucket_negative() {
        // 150 tokens against a 100-token bucket: the call waits for the
        // shortfall, then the bucket goes transiently negative.
        let limiter = RateLimiter::new(60, 100);
        limiter.wait_if_needed(150).await;
        let (_, tokens) = limiter.levels().await;
        assert!(tokens < 0.0, "token bucket was {tokens}");
    }

    #[tokio::test(start_paused = true)]
    async fn drained_request_bucket_forces_wait() {
        let limiter = RateLimiter::new(60, 1_000_000);
        for _ in 0..60 {
            limiter.wait_if_needed(1).await;
        }
        // Bucket is empty; the next call must sleep roughly one second
        // (one request per second at 60 rpm).
        let start = tokio::time::Instant::now();
        limiter.wait_if_needed(1).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    }
}
