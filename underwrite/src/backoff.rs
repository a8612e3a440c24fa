//! Exponential backoff with jitter for per-step retries.
//!
//! Delay for attempt n (1-based) is `base * multiplier^(n-1)`, capped, plus
//! up to 50% uniform jitter so concurrent runs do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(multiplier: f64) -> Self {
        Self {
            base: DEFAULT_BASE,
            multiplier: multiplier.max(1.0),
        }
    }

    #[cfg(test)]
    fn with_base(base: Duration, multiplier: f64) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Deterministic part of the delay before retrying after `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.powi(exp as i32);
        let millis = (self.base.as_millis() as f64 * factor).min(MAX_DELAY.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay with up to 50% uniform jitter added.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        base.mul_f64(1.0 + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_by_multiplier() {
        let backoff = Backoff::with_base(Duration::from_millis(100), 2.0);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::with_base(Duration::from_secs(10), 4.0);
        assert_eq!(backoff.delay(10), MAX_DELAY);
    }

    #[test]
    fn multiplier_below_one_is_clamped() {
        let backoff = Backoff::with_base(Duration::from_millis(100), 0.1);
        assert_eq!(backoff.delay(2), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_half_extra() {
        let backoff = Backoff::with_base(Duration::from_millis(100), 2.0);
        for _ in 0..50 {
            let d = backoff.jittered(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));
        }
    }
}
