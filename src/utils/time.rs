//! Deadline arithmetic for bounded waits

use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years; the same horizon tokio uses for "never"
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating to a far-future instant instead of overflowing.
///
/// Callers pass `Duration::MAX` to mean "wait indefinitely".
pub fn deadline_after(timeout: Duration) -> Instant {
    saturating_add(Instant::now(), timeout)
}

pub(crate) fn saturating_add(instant: Instant, duration: Duration) -> Instant {
    instant
        .checked_add(duration)
        .unwrap_or_else(|| instant + FAR_FUTURE)
}
