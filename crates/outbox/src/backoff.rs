//! Idle polling backoff.
//!
//! While the outbox is empty each poll sleeps `current * (1 + jitter * r)`
//! (capped at `max`) and then doubles `current`, up to `max`. A successful
//! claim resets `current` to the base interval. Jitter keeps independent
//! worker processes from polling in lockstep.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct IdleBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl IdleBackoff {
    /// `jitter` is clamped to `[0, 1]`; `max` is raised to `base` if smaller.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        let max = max.max(base);
        Self {
            base,
            max,
            jitter,
            current: base,
        }
    }

    /// Delay the next sleep would start from, before jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Sleep duration for this idle poll, advancing the backoff.
    ///
    /// `random` is a sample from `[0, 1)`; it is clamped so callers cannot
    /// push the delay outside `[current, max]`.
    pub fn next_delay(&mut self, random: f64) -> Duration {
        let r = if random.is_finite() { random.clamp(0.0, 1.0) } else { 0.0 };
        let extra = (self.current.as_nanos() as f64 * self.jitter * r) as u64;
        let delay = self.current.saturating_add(Duration::from_nanos(extra)).min(self.max);
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_until_capped_then_resets() {
        let mut backoff = IdleBackoff::new(Duration::from_secs(3), Duration::from_secs(60), 0.0);
        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay(0.5).as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 48, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(3));
    }

    #[test]
    fn jitter_scales_up_to_the_configured_fraction() {
        let mut backoff = IdleBackoff::new(Duration::from_secs(4), Duration::from_secs(60), 0.25);
        assert_eq!(backoff.next_delay(1.0), Duration::from_secs(5));
    }

    #[test]
    fn bad_inputs_are_clamped() {
        let backoff = IdleBackoff::new(Duration::from_secs(10), Duration::from_secs(1), f64::NAN);
        assert_eq!(backoff.max(), Duration::from_secs(10));

        let mut backoff = IdleBackoff::new(Duration::from_secs(1), Duration::from_secs(8), 5.0);
        assert_eq!(backoff.next_delay(7.0), Duration::from_secs(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn idle_delays_never_decrease_and_never_exceed_max(
            base_ms in 1u64..5_000,
            extra_ms in 0u64..120_000,
            jitter in 0.0f64..=1.0,
            samples in prop::collection::vec(0.0f64..1.0, 1..64),
        ) {
            let base = Duration::from_millis(base_ms);
            let max = base + Duration::from_millis(extra_ms);
            let mut backoff = IdleBackoff::new(base, max, jitter);

            let mut previous = Duration::ZERO;
            for r in samples {
                let delay = backoff.next_delay(r);
                prop_assert!(delay <= max);
                prop_assert!(delay >= previous);
                previous = delay;
            }

            backoff.reset();
            prop_assert_eq!(backoff.current(), base);
        }
    }
}
