// Reconnect backoff with exponential growth and jitter

use rand::Rng;
use std::time::Duration;

/// Delay policy between reconnect attempts
pub trait RetryStrategy: Send + Sync {
    /// Delay before reconnect attempt `attempt` (0-based)
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with jitter that never gives up
///
/// Sequence: base, 2·base, 4·base, ... capped at `max_delay`. Jitter adds up
/// to `jitter_factor` of the capped delay so reconnecting instances spread out.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_ms: base_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(base_delay_ms.max(1)),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Exponential delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.add_jitter_ms(self.calculate_base_delay(attempt)))
    }
}

/// Fixed delay, for tests
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let strategy = ExponentialBackoff::with_config(500, 30_000, 0.0);

        assert_eq!(strategy.calculate_base_delay(0), 500);
        assert_eq!(strategy.calculate_base_delay(1), 1_000);
        assert_eq!(strategy.calculate_base_delay(2), 2_000);
        assert_eq!(strategy.calculate_base_delay(5), 16_000);
        assert_eq!(strategy.calculate_base_delay(6), 30_000);
        assert_eq!(strategy.calculate_base_delay(200), 30_000);
    }

    #[test]
    fn test_never_gives_up() {
        let strategy = ExponentialBackoff::with_config(500, 30_000, 0.0);
        assert_eq!(strategy.next_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let strategy = ExponentialBackoff::with_config(1_000, 8_000, 0.1);
        for attempt in 0..10 {
            let base = strategy.calculate_base_delay(attempt);
            let delay = strategy.next_delay(attempt).as_millis() as u64;
            assert!(delay >= base);
            assert!(delay <= base + base / 10);
        }
    }

    #[test]
    fn test_config_is_clamped() {
        let strategy = ExponentialBackoff::with_config(0, 0, 5.0);
        assert_eq!(strategy.next_delay(0).as_millis() as u64 >= 1, true);
        assert!(strategy.jitter_factor <= 1.0);
    }

    #[test]
    fn test_fixed_delay() {
        let strategy = FixedDelay::new(Duration::from_millis(10));
        assert_eq!(strategy.next_delay(0), Duration::from_millis(10));
        assert_eq!(strategy.next_delay(99), Duration::from_millis(10));
    }
}
