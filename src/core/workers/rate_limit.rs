use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

/// Token bucket allowing `rate` acquisitions per second with a burst of `rate`.
/// A rate of zero disables limiting.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32) -> Self {
        let rate = rate_per_sec as f64;
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        if self.rate == 0.0 {
            return;
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let refill = now.duration_since(state.last_refill).as_secs_f64() * self.rate;
                state.tokens = (state.tokens + refill).min(self.rate);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
