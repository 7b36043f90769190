//! Foundational low-level utilities shared across relay crates.
//!
//! Provides the injectable clock and the time helpers used by instance expiry
//! and quota bookkeeping.

pub mod clock;
pub mod time_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use time_utils::{expires_after_hours, is_expired_at, saturating_hours};

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn is_expired_at_is_inclusive_of_the_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 6, 29, 22, 0, 20).unwrap();
        assert!(is_expired_at(now, now));
        assert!(is_expired_at(now - Duration::seconds(1), now));
        assert!(!is_expired_at(now + Duration::seconds(1), now));
    }

    #[test]
    fn expires_after_hours_adds_duration() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            expires_after_hours(created, 24),
            Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()
        );
        assert_eq!(expires_after_hours(created, 0), created);
    }

    #[test]
    fn manual_clock_advances_and_system_clock_moves_forward() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(3));
        assert_eq!(clock.now(), start + Duration::hours(3));

        let before = Utc::now();
        assert!(SystemClock.now() >= before);
    }
}
