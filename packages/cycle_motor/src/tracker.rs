use std::fmt;
use std::num::NonZero;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{
    Activity, BoxError, CycleResultSegmentBuffer, Error, FAILED, ResultCode, SKIPPED, result_code,
};

/// Bounds the asynchronous operations in flight for one motor and collects their failures.
pub(crate) struct OpTracker {
    limit: NonZero<usize>,
    pending: Mutex<usize>,
    changed: Condvar,

    // The first error raised while completing a stride; the motor picks it up at its next
    // stride boundary.
    failure: Mutex<Option<Error>>,
}

impl OpTracker {
    pub(crate) fn new(limit: NonZero<usize>) -> Self {
        Self {
            limit,
            pending: Mutex::new(0),
            changed: Condvar::new(),
            failure: Mutex::new(None),
        }
    }

    /// Reserves room for one more operation, waiting while the limit is reached.
    ///
    /// Gives up and returns `false` as soon as `keep_waiting` says so.
    pub(crate) fn acquire(&self, keep_waiting: impl Fn() -> bool) -> bool {
        const RECHECK_INTERVAL: Duration = Duration::from_millis(10);

        let mut pending = self.pending.lock();

        while *pending >= self.limit.get() {
            if !keep_waiting() {
                return false;
            }

            self.changed.wait_for(&mut pending, RECHECK_INTERVAL);
        }

        *pending = pending.saturating_add(1);
        true
    }

    pub(crate) fn release(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        self.changed.notify_all();
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Waits until no operations are in flight.
    ///
    /// Returns `false` if operations were still in flight when `timeout` elapsed.
    pub(crate) fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut pending = self.pending.lock();

        while *pending > 0 {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut pending, deadline).timed_out() {
                        return *pending == 0;
                    }
                }
                None => self.changed.wait(&mut pending),
            }
        }

        true
    }

    pub(crate) fn record_failure(&self, error: Error) {
        let mut failure = self.failure.lock();

        if failure.is_none() {
            *failure = Some(error);
        } else {
            warn!(%error, "discarding failure, an earlier one is already pending");
        }
    }

    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }
}

impl fmt::Debug for OpTracker {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpTracker")
            .field("limit", &self.limit)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Collects the results of one stride's asynchronous operations in completion order.
///
/// When the last expected result arrives, the stride is timed and forwarded to the output
/// exactly once, by whichever thread delivered that result.
pub(crate) struct StrideTracker {
    activity: Activity,
    ops: Arc<OpTracker>,

    recycle: u64,
    min_cycle: u64,
    expected: usize,
    started: Instant,
    delay: Duration,

    state: Mutex<StrideResults>,
}

#[derive(Debug)]
struct StrideResults {
    buffer: CycleResultSegmentBuffer,
    completed: usize,
}

impl StrideTracker {
    pub(crate) fn new(
        activity: Activity,
        ops: Arc<OpTracker>,
        recycle: u64,
        min_cycle: u64,
        expected: usize,
        delay: Duration,
    ) -> Self {
        Self {
            activity,
            ops,
            recycle,
            min_cycle,
            expected,
            started: Instant::now(),
            delay,
            state: Mutex::new(StrideResults {
                buffer: CycleResultSegmentBuffer::with_capacity(expected),
                completed: 0,
            }),
        }
    }

    pub(crate) fn complete(&self, cycle: u64, result: ResultCode) {
        let output = self.activity.output();

        let segment = {
            let mut state = self.state.lock();

            if state.completed >= self.expected {
                warn!(cycle, "result arrived after its stride was complete, ignoring it");
                return;
            }

            if output.is_some() {
                state.buffer.append(cycle, result);
            }
            state.completed = state.completed.saturating_add(1);

            if state.completed < self.expected {
                return;
            }

            output.is_some().then(|| state.buffer.to_reader())
        };

        self.activity
            .instrumentation()
            .record_stride(self.started.elapsed().saturating_add(self.delay));

        let (Some(output), Some(segment)) = (output, segment) else {
            return;
        };

        if let Err(source) = output.on_recycle_result_segment(self.recycle, &segment) {
            self.ops.record_failure(Error::Output {
                min_cycle: self.min_cycle,
                source,
            });
        }
    }
}

impl fmt::Debug for StrideTracker {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrideTracker")
            .field("recycle", &self.recycle)
            .field("min_cycle", &self.min_cycle)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

/// One asynchronous operation handed to an [`AsyncAction`][crate::AsyncAction].
///
/// Report the outcome exactly once by consuming the op with [`succeed()`][Self::succeed],
/// [`fail()`][Self::fail] or [`skip()`][Self::skip]. The op can be moved to and completed on
/// any thread. An op dropped without an outcome is recorded as skipped.
#[must_use = "the outcome of a tracked op must be reported"]
pub struct TrackedOp {
    cycle: u64,
    started: Instant,
    delay: Duration,
    stride: Arc<StrideTracker>,
    ops: Arc<OpTracker>,
    reported: bool,
}

impl TrackedOp {
    pub(crate) fn new(
        cycle: u64,
        delay: Duration,
        stride: Arc<StrideTracker>,
        ops: Arc<OpTracker>,
    ) -> Self {
        Self {
            cycle,
            started: Instant::now(),
            delay,
            stride,
            ops,
            reported: false,
        }
    }

    /// The cycle this operation executes.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// How long the operation has been in flight, including its cycle rate limiter delay.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed().saturating_add(self.delay)
    }

    /// Reports that the operation completed with the given result code.
    pub fn succeed(mut self, result: i32) {
        self.report(result_code(result), Outcome::Completed);
    }

    /// Reports that the operation failed.
    ///
    /// The failure is recorded as [`FAILED`] and counted in the activity instrumentation. It
    /// does not stop the motor.
    pub fn fail(mut self, error: BoxError) {
        debug!(cycle = self.cycle, %error, "asynchronous operation failed");
        self.report(FAILED, Outcome::Failed);
    }

    /// Reports that the operation was never executed.
    pub fn skip(mut self) {
        self.report(SKIPPED, Outcome::Skipped);
    }

    fn report(&mut self, result: ResultCode, outcome: Outcome) {
        self.reported = true;

        let instrumentation = self.stride.activity.instrumentation();
        match outcome {
            Outcome::Completed => instrumentation.record_cycle(self.elapsed()),
            Outcome::Failed => instrumentation.record_failed(self.elapsed()),
            Outcome::Skipped => instrumentation.record_skipped(1),
        }

        self.stride.complete(self.cycle, result);
        self.ops.release();
    }
}

impl Drop for TrackedOp {
    fn drop(&mut self) {
        if !self.reported {
            warn!(
                cycle = self.cycle,
                "tracked op dropped without an outcome, recording it as skipped"
            );
            self.report(SKIPPED, Outcome::Skipped);
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Completed,
    Failed,
    Skipped,
}

impl fmt::Debug for TrackedOp {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedOp")
            .field("cycle", &self.cycle)
            .field("elapsed", &self.elapsed())
            .finish_non_exhaustive()
    }
}

/// Reports `cycle` as skipped for a stride whose op was never created.
pub(crate) fn skip_untracked(stride: &StrideTracker, cycle: u64) {
    stride.activity.instrumentation().record_skipped(1);
    stride.complete(cycle, SKIPPED);
}
