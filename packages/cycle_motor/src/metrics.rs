//! Process-wide metrics for cycle motors.
//!
//! These complement the activity-scoped [`ActivityInstrumentation`][crate::ActivityInstrumentation]:
//! the events here aggregate across every activity in the process and are published through
//! `nm`, so any `nm` report includes them. The metrics use per-thread event instances, which
//! suits motors well because each motor owns its thread.

use std::time::Duration;

use nm::{Event, Magnitude};

/// Histogram buckets for service times in microseconds.
///
/// Service times include rate limiter delay, so under load they can grow far beyond the time the
/// action itself takes.
const SERVICE_TIME_US_BUCKETS: &[Magnitude] = &[
    0, 10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 100_000, 1_000_000,
];

/// Histogram buckets for time spent waiting for a segment from the input, in microseconds.
///
/// Acquisition is a single atomic operation for the standard input, so we expect nearly
/// everything in the lowest bucket.
const INPUT_TIME_US_BUCKETS: &[Magnitude] = &[0, 1, 5, 10, 50, 100, 1_000];

thread_local! {
    /// Service time of one cycle, including cycle rate limiter delay.
    pub(crate) static CYCLE_SERVICE_TIME_US: Event = Event::builder()
        .name("cycle_motor_cycle_service_time_us")
        .histogram(SERVICE_TIME_US_BUCKETS)
        .build();

    /// Service time of one stride, including stride rate limiter delay.
    pub(crate) static STRIDE_SERVICE_TIME_US: Event = Event::builder()
        .name("cycle_motor_stride_service_time_us")
        .histogram(SERVICE_TIME_US_BUCKETS)
        .build();

    /// Time spent acquiring one segment from the input.
    pub(crate) static INPUT_TIME_US: Event = Event::builder()
        .name("cycle_motor_input_time_us")
        .histogram(INPUT_TIME_US_BUCKETS)
        .build();

    /// Scheduling delay reported by a rate limiter when admitting one operation.
    pub(crate) static RATE_LIMIT_DELAY_US: Event = Event::builder()
        .name("cycle_motor_rate_limit_delay_us")
        .histogram(SERVICE_TIME_US_BUCKETS)
        .build();

    /// Cycles that were reserved but abandoned because their motor stopped.
    ///
    /// The magnitude is the number of cycles abandoned at once.
    pub(crate) static ABANDONED_CYCLES: Event = Event::builder()
        .name("cycle_motor_abandoned_cycles")
        .build();
}

pub(crate) fn micros(duration: Duration) -> Magnitude {
    Magnitude::try_from(duration.as_micros()).unwrap_or(Magnitude::MAX)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn micros_saturates() {
        assert_eq!(micros(Duration::from_millis(3)), 3_000);
        assert_eq!(micros(Duration::MAX), Magnitude::MAX);
    }
}
