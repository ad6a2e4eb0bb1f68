use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Randomized inter-request delay, uniform in `[min_delay, max_delay]`.
///
/// Stateless apart from the configured bounds and the random source; the
/// seeded constructor exists so tests can pin the sequence.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    rng: StdRng,
}

impl RateLimiter {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self::with_rng(min_delay, max_delay, StdRng::from_entropy())
    }

    pub fn seeded(min_delay: Duration, max_delay: Duration, seed: u64) -> Self {
        Self::with_rng(min_delay, max_delay, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(min_delay: Duration, max_delay: Duration, rng: StdRng) -> Self {
        // Misordered bounds collapse to the lower one rather than erroring.
        let max_delay = max_delay.max(min_delay);
        Self {
            min_delay,
            max_delay,
            rng,
        }
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }

    /// Samples the next delay without sleeping.
    pub fn compute_delay(&mut self) -> Duration {
        if self.max_delay.is_zero() {
            return self.min_delay;
        }
        let low = self.min_delay.as_secs_f64();
        let high = self.max_delay.as_secs_f64();
        if high <= low {
            return self.min_delay;
        }
        Duration::from_secs_f64(self.rng.gen_range(low..=high))
    }

    /// Suspends the calling task for one sampled delay and returns it, so
    /// callers can account wall-clock budget.
    pub async fn sleep(&mut self) -> Duration {
        let delay = self.compute_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}
