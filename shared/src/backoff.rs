use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with up to 20% random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Backoff with no delay at all, for tests.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let capped = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if capped.is_zero() {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        capped.mul_f64(1.0 + jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));

        let first = backoff.delay(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(120));

        let third = backoff.delay(3);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(480));

        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(Backoff::immediate().delay(7), Duration::ZERO);
    }
}
