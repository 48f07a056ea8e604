//! Exponential backoff with a cap and jitter, shared by the control and data-plane
//! reconnect loops.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff, doubling on every failure up to a configured cap, resetting to the
/// initial delay whenever the caller reports success. Full jitter is applied on top of the
/// capped delay so that many agents reconnecting to the same outage don't retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// `base` is the delay after the first failure; `max` caps every subsequent delay
    /// before jitter is applied.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt, then advances the internal attempt counter.
    /// Returns a value uniformly sampled from `[0, capped_delay]` ("full jitter"), so the
    /// cap bounds the worst case while still spreading out concurrent retries.
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.capped_delay_millis();
        self.attempt = self.attempt.saturating_add(1);
        let jittered = if capped == 0 {
            0
        } else {
            rand::rng().random_range(0..=capped)
        };
        Duration::from_millis(jittered)
    }

    fn capped_delay_millis(&self) -> u64 {
        let factor = 1u64.checked_shl(self.attempt.min(32)).unwrap_or(u64::MAX);
        let scaled = self.base.as_millis().saturating_mul(factor as u128);
        scaled.min(self.max.as_millis()).min(u128::from(u64::MAX)) as u64
    }

    /// Resets the backoff to its initial state. Called on every successful authentication.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_the_capped_exponential_bound() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        let bounds = [100u64, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 30000];

        for &bound in &bounds {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(bound));
        }
    }

    #[test]
    fn delay_stays_capped_well_past_the_cap_attempt() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(30));
        }
    }

    #[test]
    fn reset_returns_to_base_delay_bound() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }
}
