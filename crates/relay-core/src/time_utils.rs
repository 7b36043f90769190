use chrono::{DateTime, Duration, Utc};

/// Returns true when `expires_at` is no longer in the future relative to `now`.
pub fn is_expired_at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at <= now
}

/// Converts an hour count into a `chrono::Duration`, clamping on overflow.
pub fn saturating_hours(hours: u32) -> Duration {
    Duration::try_hours(i64::from(hours)).unwrap_or(Duration::MAX)
}

/// Computes the expiry timestamp for something created at `created_at` that
/// lives for `duration_hours`.
pub fn expires_after_hours(created_at: DateTime<Utc>, duration_hours: u32) -> DateTime<Utc> {
    created_at
        .checked_add_signed(saturating_hours(duration_hours))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
