//! Time and identity sources.
//!
//! Components never call `Utc::now()` or `thread_rng()` directly; they take a
//! [`Clock`] and (where jitter is needed) a [`JitterSource`] so tests can pin
//! both.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Seconds since the Unix epoch, with millisecond resolution.
pub trait Clock: Send + Sync {
    fn now(&self) -> Decimal;

    fn now_ms(&self) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        (self.now() * Decimal::from(1000)).to_i64().unwrap_or(0)
    }
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Decimal {
        Decimal::new(chrono::Utc::now().timestamp_millis(), 3)
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Decimal>>,
}

impl ManualClock {
    pub fn new(start: Decimal) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, seconds: Decimal) {
        *self.now.lock() += seconds;
    }

    pub fn set(&self, seconds: Decimal) {
        *self.now.lock() = seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Decimal {
        *self.now.lock()
    }
}

/// New v4 UUID as a string, the id format used across orders, quotes and
/// outbox events.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Source of multiplicative jitter for retry backoff.
pub trait JitterSource: Send + Sync {
    /// Multiplier applied to a computed delay.
    fn factor(&self) -> f64;
}

/// Uniform jitter in `[1 - spread, 1 + spread]`.
#[derive(Debug, Clone)]
pub struct UniformJitter {
    spread: f64,
}

impl UniformJitter {
    pub fn new(spread: f64) -> Self {
        Self { spread }
    }
}

impl Default for UniformJitter {
    fn default() -> Self {
        Self { spread: 0.2 }
    }
}

impl JitterSource for UniformJitter {
    fn factor(&self) -> f64 {
        use rand::Rng;
        rand::thread_rng().gen_range(1.0 - self.spread..=1.0 + self.spread)
    }
}

/// Jitter disabled; delays come out exactly as computed.
#[derive(Debug, Clone, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn factor(&self) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(dec!(100));
        assert_eq!(clock.now(), dec!(100));
        assert_eq!(clock.now_ms(), 100_000);
        clock.advance(dec!(1.5));
        assert_eq!(clock.now(), dec!(101.5));
        assert_eq!(clock.now_ms(), 101_500);
    }

    #[test]
    fn system_clock_is_monotone_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn uuids_are_unique() {
        assert_ne!(new_uuid(), new_uuid());
    }

    #[test]
    fn uniform_jitter_stays_in_band() {
        let jitter = UniformJitter::default();
        for _ in 0..100 {
            let f = jitter.factor();
            assert!((0.8..=1.2).contains(&f));
        }
    }
}
