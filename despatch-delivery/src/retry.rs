//! Retry schedule for mail that could not be delivered.
//!
//! Delays are measured from the *first* failure of a mail, so each entry is a
//! cumulative threshold rather than the wait since the previous attempt.

use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Delay before a mail with `n` recorded retries becomes ready again, indexed by `n`.
pub const RETRY_DELAYS: [Duration; 12] = [
    Duration::ZERO,
    Duration::from_secs(5 * MINUTE),
    Duration::from_secs(30 * MINUTE),
    Duration::from_secs(HOUR),
    Duration::from_secs(2 * HOUR),
    Duration::from_secs(3 * HOUR),
    Duration::from_secs(4 * HOUR),
    Duration::from_secs(6 * HOUR),
    Duration::from_secs(12 * HOUR),
    Duration::from_secs(24 * HOUR),
    Duration::from_secs(48 * HOUR),
    Duration::from_secs(72 * HOUR),
];

/// The highest retry count that still earns another attempt.
#[allow(clippy::cast_possible_truncation)]
pub const LAST_RETRY: u32 = RETRY_DELAYS.len() as u32 - 1;

/// Delay for a mail with `retries` recorded retries, or `None` past the end of
/// the table.
#[must_use]
pub fn delay(retries: u32) -> Option<Duration> {
    usize::try_from(retries)
        .ok()
        .and_then(|index| RETRY_DELAYS.get(index).copied())
}

/// Whether a further failure at `retries` exhausts the schedule.
#[must_use]
pub const fn is_exhausted(retries: u32) -> bool {
    retries >= LAST_RETRY
}
