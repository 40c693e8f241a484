// Exponential backoff with multiplicative jitter, shared by reconnects and send retries

use rand::Rng;
use std::time::Duration;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Backoff {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            config.backoff_jitter,
        )
    }

    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt, unit)
    }

    /// Deterministic variant: `unit` in [-1, 1] picks where in the jitter band to land.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;

        // 2^20 seconds is far past any sane cap
        let exp = attempt.min(20) as i32;
        let raw = (base_ms * 2f64.powi(exp)).min(cap_ms);

        let factor = 1.0 + unit.clamp(-1.0, 1.0) * self.jitter;
        Duration::from_millis((raw * factor).round() as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_base_until_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_with(0, 0.0), Duration::from_secs(1));
        assert_eq!(backoff.delay_with(1, 0.0), Duration::from_secs(2));
        assert_eq!(backoff.delay_with(4, 0.0), Duration::from_secs(16));
        assert_eq!(backoff.delay_with(5, 0.0), Duration::from_secs(30));
        assert_eq!(backoff.delay_with(400, 0.0), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_band_is_twenty_percent() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_with(0, 1.0), Duration::from_millis(1200));
        assert_eq!(backoff.delay_with(0, -1.0), Duration::from_millis(800));
        assert_eq!(backoff.delay_with(10, 1.0), Duration::from_secs(36));
    }

    #[test]
    fn test_random_delays_stay_in_band() {
        let backoff = Backoff::default();
        for attempt in 0..8 {
            let centre = backoff.delay_with(attempt, 0.0).as_millis() as f64;
            let delay = backoff.delay(attempt).as_millis() as f64;
            assert!(delay >= centre * 0.8 - 1.0, "attempt {} too short: {}", attempt, delay);
            assert!(delay <= centre * 1.2 + 1.0, "attempt {} too long: {}", attempt, delay);
        }
    }
}
