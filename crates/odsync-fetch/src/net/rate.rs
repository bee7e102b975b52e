//! Process-global request pacing.
//!
//! Probe and catalog requests share one token bucket plus a jittered delay;
//! byte transfers are not counted as discrete requests.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Jitter bounds between paced requests, in milliseconds.
const JITTER_MS: (u64, u64) = (300, 700);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with one-second burst capacity.
///
/// A non-positive rate disables pacing entirely.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_s: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_s: f64) -> Self {
        Self {
            rate_per_s,
            capacity: rate_per_s.max(1.0),
            state: Mutex::new(BucketState {
                tokens: rate_per_s.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        if self.rate_per_s <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().expect("token bucket poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_s).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.rate_per_s,
                    ))
                }
            };
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Pace a probe request: one token plus 300–700 ms of jitter.
    pub async fn pace_probe(&self) {
        self.acquire().await;
        if self.rate_per_s <= 0.0 {
            return;
        }
        let (lo, hi) = JITTER_MS;
        let jitter = lo + fastrand::u64(..=(hi - lo));
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_paces_to_rate() {
        let bucket = TokenBucket::new(2.0);
        let start = Instant::now();

        // Burst capacity covers the first two, the rest wait half a second each.
        for _ in 0..4 {
            bucket.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn zero_rate_never_blocks() {
        let bucket = TokenBucket::new(0.0);
        for _ in 0..100 {
            bucket.acquire().await;
        }
    }
}
