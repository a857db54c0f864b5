use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::metrics::{
    ABANDONED_CYCLES, CYCLE_SERVICE_TIME_US, INPUT_TIME_US, STRIDE_SERVICE_TIME_US, micros,
};

/// Accumulates durations from any number of threads.
#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl Timer {
    /// Records one measurement.
    pub fn record(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// The number of measurements.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The sum of all measurements.
    #[must_use]
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed))
    }

    /// The longest measurement.
    #[must_use]
    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed))
    }

    /// The mean of all measurements, zero if there are none.
    #[must_use]
    pub fn mean(&self) -> Duration {
        let count = self.count();
        let total = self.total_nanos.load(Ordering::Relaxed);

        Duration::from_nanos(total.checked_div(count).unwrap_or(0))
    }
}

/// A monotonically increasing count, updated from any number of threads.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Adds `n`.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// The current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Timers and counters shared by all motors of one activity.
///
/// Controllers (e.g. an adaptive rate search) read these while the activity runs.
/// Service times include rate limiter delay, so they reflect what a client issuing operations
/// on schedule would have experienced.
#[derive(Debug, Default)]
pub struct ActivityInstrumentation {
    input: Timer,
    strides_service: Timer,
    strides_delay: Timer,
    cycles_service: Timer,
    cycles_delay: Timer,

    cycles_completed: Counter,
    cycles_skipped: Counter,
    cycles_failed: Counter,
}

impl ActivityInstrumentation {
    /// Time spent acquiring segments from the input.
    #[must_use]
    pub fn input(&self) -> &Timer {
        &self.input
    }

    /// Service time of whole strides, including stride rate limiter delay.
    #[must_use]
    pub fn strides_service(&self) -> &Timer {
        &self.strides_service
    }

    /// Scheduling delay reported by the stride rate limiter, one measurement per admitted stride.
    ///
    /// Empty when no stride rate is configured.
    #[must_use]
    pub fn strides_delay(&self) -> &Timer {
        &self.strides_delay
    }

    /// Service time of individual cycles, including cycle rate limiter delay.
    ///
    /// Failed cycles are measured too.
    #[must_use]
    pub fn cycles_service(&self) -> &Timer {
        &self.cycles_service
    }

    /// Scheduling delay reported by the cycle rate limiter, one measurement per admitted cycle.
    ///
    /// Empty when no cycle rate is configured.
    #[must_use]
    pub fn cycles_delay(&self) -> &Timer {
        &self.cycles_delay
    }

    /// Cycles whose action completed without raising an error, with any result code.
    #[must_use]
    pub fn cycles_completed(&self) -> &Counter {
        &self.cycles_completed
    }

    /// Cycles that were reserved but never executed.
    #[must_use]
    pub fn cycles_skipped(&self) -> &Counter {
        &self.cycles_skipped
    }

    /// Cycles whose action raised an error.
    ///
    /// Fatal for synchronous and stride actions. Asynchronous operations that fail are recorded
    /// as [`FAILED`][crate::FAILED] and the motor carries on.
    #[must_use]
    pub fn cycles_failed(&self) -> &Counter {
        &self.cycles_failed
    }

    pub(crate) fn record_input(&self, duration: Duration) {
        self.input.record(duration);
        INPUT_TIME_US.with(|e| e.observe(micros(duration)));
    }

    pub(crate) fn record_stride(&self, duration: Duration) {
        self.strides_service.record(duration);
        STRIDE_SERVICE_TIME_US.with(|e| e.observe(micros(duration)));
    }

    pub(crate) fn record_stride_delay(&self, delay: Duration) {
        self.strides_delay.record(delay);
    }

    pub(crate) fn record_cycle_delay(&self, delay: Duration) {
        self.cycles_delay.record(delay);
    }

    pub(crate) fn record_cycle(&self, duration: Duration) {
        self.record_cycle_service(duration);
        self.cycles_completed.add(1);
    }

    pub(crate) fn record_skipped(&self, count: u64) {
        if count == 0 {
            return;
        }

        self.cycles_skipped.add(count);
        ABANDONED_CYCLES.with(|e| e.observe(count));
    }

    pub(crate) fn record_failed(&self, duration: Duration) {
        self.record_cycle_service(duration);
        self.cycles_failed.add(1);
    }

    fn record_cycle_service(&self, duration: Duration) {
        self.cycles_service.record(duration);
        CYCLE_SERVICE_TIME_US.with(|e| e.observe(micros(duration)));
    }
}
