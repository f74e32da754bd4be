//! When to evict stale events.
//!
//! Sweeping deletes every event older than the retention horizon, across all
//! event types. It is housekeeping only, so `track()` runs it on a sample of
//! calls instead of every call.

use chrono::Duration;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default share of `track()` calls that sweep.
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.001;

/// Default age after which events are evicted.
pub fn default_retention() -> Duration {
    Duration::days(7)
}

/// Decides whether a given `track()` call sweeps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepTrigger {
    /// Never sweep from `track()`
    Never,
    /// Sweep on every call
    Always,
    /// Sweep with this probability, clamped to `0.0..=1.0`
    Probability(f64),
    /// Sweep on the first call and every `n`th call after it
    EveryNth(u64),
}

impl SweepTrigger {
    /// Called once per `track()`; `calls` is the limiter's call counter.
    pub fn fires(&self, calls: &AtomicU64) -> bool {
        let call = calls.fetch_add(1, Ordering::Relaxed);
        match *self {
            SweepTrigger::Never => false,
            SweepTrigger::Always => true,
            SweepTrigger::Probability(p) => {
                if p.is_nan() || p <= 0.0 {
                    false
                } else {
                    rand::thread_rng().gen_bool(p.min(1.0))
                }
            }
            SweepTrigger::EveryNth(0) => false,
            SweepTrigger::EveryNth(n) => call % n == 0,
        }
    }
}

impl Default for SweepTrigger {
    fn default() -> Self {
        SweepTrigger::Probability(DEFAULT_SWEEP_PROBABILITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fired(trigger: SweepTrigger, calls: usize) -> usize {
        let counter = AtomicU64::new(0);
        (0..calls).filter(|_| trigger.fires(&counter)).count()
    }

    #[test]
    fn test_never_and_always() {
        assert_eq!(fired(SweepTrigger::Never, 50), 0);
        assert_eq!(fired(SweepTrigger::Always, 50), 50);
    }

    #[test]
    fn test_every_nth() {
        assert_eq!(fired(SweepTrigger::EveryNth(10), 25), 3);
        assert_eq!(fired(SweepTrigger::EveryNth(1), 5), 5);
        assert_eq!(fired(SweepTrigger::EveryNth(0), 5), 0);
    }

    #[test]
    fn test_probability_bounds() {
        assert_eq!(fired(SweepTrigger::Probability(0.0), 1000), 0);
        assert_eq!(fired(SweepTrigger::Probability(-1.0), 10), 0);
        assert_eq!(fired(SweepTrigger::Probability(f64::NAN), 10), 0);
        assert_eq!(fired(SweepTrigger::Probability(1.0), 100), 100);
        assert_eq!(fired(SweepTrigger::Probability(7.5), 10), 10);
    }

    #[test]
    fn test_default_is_rare() {
        assert_eq!(
            SweepTrigger::default(),
            SweepTrigger::Probability(DEFAULT_SWEEP_PROBABILITY)
        );
        assert_eq!(default_retention(), Duration::days(7));
    }
}
