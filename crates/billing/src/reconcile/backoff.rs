//! Retry schedule for queued reconciliation tasks

use std::time::Duration;

/// Total attempts a task may receive, including the synchronous first attempt
/// made by the webhook handler before the task is queued.
pub const MAX_ATTEMPTS: u32 = 4;

/// Delay before attempts 2, 3 and 4, measured from the previous failure.
const RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(9),
];

/// Fixed backoff schedule.
///
/// Identity-store outages are expected to last seconds, so the whole schedule
/// spans about 13 seconds. Once [`MAX_ATTEMPTS`] attempts have failed a task is
/// dead-lettered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffPolicy;

impl BackoffPolicy {
    pub const fn new() -> Self {
        Self
    }

    pub const fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    /// Minimum wait since the previous failure before `attempt` may be made.
    ///
    /// Returns `None` for attempt numbers the schedule does not allow: the
    /// first attempt (it never goes through the queue) and anything past
    /// [`MAX_ATTEMPTS`].
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match attempt {
            2..=MAX_ATTEMPTS => RETRY_SCHEDULE.get((attempt - 2) as usize).copied(),
            _ => None,
        }
    }

    /// Whether a task that has already made `attempts_made` attempts may be
    /// attempted again.
    pub const fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < MAX_ATTEMPTS
    }
}
