use rand::prelude::*;
use std::cell::RefCell;
use tokio::time::Duration;

thread_local! {
    static THREAD_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::seed_from_u64(seed()));
}

fn seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => 0,
    }
}

/// Backoff between two attempts of a conflicting command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    /// Base delay (in milliseconds) before applying exponential backoff and jitter
    base_delay_ms: u64,
    /// Maximum delay (in milliseconds) after applying exponential backoff and jitter
    max_delay_ms: u64,
}

impl RetryDelay {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Upper bound of the delay before retry number `retry_count`:
    /// `base_delay * 2^retry_count`, capped at `max_delay`.
    pub fn ceiling(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let exp_delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(exp_delay.min(self.max_delay_ms))
    }

    /// Picks the delay before retry number `retry_count` uniformly between
    /// zero and [`RetryDelay::ceiling`] (full jitter), so writers that lost
    /// the same race do not retry in lockstep.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let capped_delay = u64::try_from(self.ceiling(retry_count).as_millis()).unwrap_or(u64::MAX);

        let jittered_delay = THREAD_RNG.with(|rng| rng.borrow_mut().random_range(0..=capped_delay));

        Duration::from_millis(jittered_delay)
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}
