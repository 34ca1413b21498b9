//! The clock abstraction injected into every store.
//!
//! All `created_at` stamps and expiration checks go through a [`Clock`] so
//! that time-dependent behavior is testable without wall-clock sleeps. Use
//! [`SystemClock`] in production and [`ManualClock`] in tests.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// The authoritative time source of a cache store.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// A [`Clock`] backed by the operating system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A caller-controlled [`Clock`] that only moves when told to.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use cachette::{Clock, ManualClock};
///
/// let clock = ManualClock::new(chrono::Utc::now());
/// let start = clock.now();
/// clock.advance(Duration::from_secs(600));
/// assert_eq!(clock.now() - start, chrono::TimeDelta::seconds(600));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock to an absolute instant. Moving backwards is allowed.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock() = now;
    }

    /// Advances the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let mut now = self.lock();
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_frozen_until_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), start + TimeDelta::milliseconds(1500));
    }

    #[test]
    fn manual_clock_set_moves_backwards() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let earlier = start - TimeDelta::days(1);
        clock.set(earlier);
        assert_eq!(clock.now(), earlier);
    }

    #[test]
    fn system_clock_does_not_go_backwards() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
