use std::fmt;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::{
    Activity, ActivityDef, BoxError, CycleResultSegmentBuffer, CycleSegment, MotorState,
    RateLimiter, RunState, TrackedOp, result_code,
};

/// A unit of work executed synchronously, one cycle at a time.
///
/// Each motor owns its own action instance, so implementations need not be `Sync`.
///
/// Closures of the form `FnMut(u64) -> Result<i32, BoxError>` implement this trait.
pub trait SyncAction: Send {
    /// Called once by the motor before the first cycle.
    ///
    /// # Errors
    ///
    /// An error here is fatal for the motor.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Executes one cycle and returns its result code, zero meaning success.
    ///
    /// A non-zero result code is telemetry, not a failure of the motor.
    ///
    /// # Errors
    ///
    /// An error is fatal for the motor: it stops immediately and the error is returned to its
    /// owner unchanged.
    fn run_cycle(&mut self, cycle: u64) -> Result<i32, BoxError>;

    /// Called at a stride boundary after the activity definition changed.
    fn on_activity_def_update(&mut self, _def: &ActivityDef) {}
}

impl<F> SyncAction for F
where
    F: FnMut(u64) -> Result<i32, BoxError> + Send,
{
    fn run_cycle(&mut self, cycle: u64) -> Result<i32, BoxError> {
        self(cycle)
    }
}

/// A unit of work that drives a whole stride itself.
///
/// The motor lends the action a [`StrideCursor`] that hands out the cycles of the stride and
/// takes care of rate limiting, timing and result recording. This suits actions that batch
/// operations or keep per-stride state.
pub trait StrideAction: Send {
    /// Called once by the motor before the first stride.
    ///
    /// # Errors
    ///
    /// An error here is fatal for the motor.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Executes the cycles handed out by `cursor`.
    ///
    /// Implementations call [`StrideCursor::next_cycle()`] until it returns `None` and report
    /// each cycle's result with [`StrideCursor::complete()`].
    ///
    /// # Errors
    ///
    /// An error is fatal for the motor.
    fn run_stride(&mut self, cursor: &mut StrideCursor<'_>) -> Result<(), BoxError>;

    /// Called at a stride boundary after the activity definition changed.
    fn on_activity_def_update(&mut self, _def: &ActivityDef) {}
}

/// A unit of work that completes out of band.
///
/// The motor hands every cycle to [`enqueue()`][Self::enqueue] as a [`TrackedOp`] and moves on.
/// Whoever finishes the operation later reports the outcome through the op, from any thread.
/// The number of operations in flight per motor is bounded by the `async` parameter.
pub trait AsyncAction: Send {
    /// Called once by the motor before the first cycle.
    ///
    /// # Errors
    ///
    /// An error here is fatal for the motor.
    fn init(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Starts the operation for `op.cycle()`.
    ///
    /// # Errors
    ///
    /// An error means the operation could not even be started and is fatal for the motor.
    /// Failures of started operations are reported with [`TrackedOp::fail()`] instead.
    fn enqueue(&mut self, op: TrackedOp) -> Result<(), BoxError>;

    /// Called at a stride boundary after the activity definition changed.
    fn on_activity_def_update(&mut self, _def: &ActivityDef) {}
}

/// The action a motor drives, tagged with the execution path it supports.
///
/// The synchronous and stride variants run when the `async` parameter is absent. The
/// asynchronous variant requires it. Any other combination is rejected when the motor is created.
#[non_exhaustive]
pub enum MotorAction {
    /// Executed one cycle at a time on the motor thread.
    Sync(Box<dyn SyncAction>),

    /// Executed one stride at a time on the motor thread.
    Stride(Box<dyn StrideAction>),

    /// Started on the motor thread, completed out of band.
    Async(Box<dyn AsyncAction>),
}

impl MotorAction {
    /// Wraps a synchronous action.
    pub fn sync(action: impl SyncAction + 'static) -> Self {
        Self::Sync(Box::new(action))
    }

    /// Wraps a stride action.
    pub fn stride(action: impl StrideAction + 'static) -> Self {
        Self::Stride(Box::new(action))
    }

    /// Wraps an asynchronous action.
    pub fn asynchronous(action: impl AsyncAction + 'static) -> Self {
        Self::Async(Box::new(action))
    }

    /// Whether this action requires the asynchronous execution path.
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    pub(crate) fn init(&mut self) -> Result<(), BoxError> {
        match self {
            Self::Sync(action) => action.init(),
            Self::Stride(action) => action.init(),
            Self::Async(action) => action.init(),
        }
    }

    pub(crate) fn on_activity_def_update(&mut self, def: &ActivityDef) {
        match self {
            Self::Sync(action) => action.on_activity_def_update(def),
            Self::Stride(action) => action.on_activity_def_update(def),
            Self::Async(action) => action.on_activity_def_update(def),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Stride(_) => "stride",
            Self::Async(_) => "async",
        }
    }
}

impl fmt::Debug for MotorAction {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MotorAction").field(&self.kind()).finish()
    }
}

#[derive(Debug)]
struct InFlight {
    cycle: u64,
    started: Instant,
    delay: Duration,
}

/// Hands out the cycles of one stride and records their results.
///
/// Each call to [`next_cycle()`][Self::next_cycle] checks for a pending stop of the motor or of
/// its whole activity, waits for the cycle rate limiter and starts the service timer of the
/// cycle it returns. The cycle stays in flight until [`complete()`][Self::complete] records its
/// result.
pub struct StrideCursor<'a> {
    segment: &'a mut CycleSegment,
    buffer: &'a mut CycleResultSegmentBuffer,
    cycle_limiter: Option<&'a RateLimiter>,
    activity: &'a Activity,
    state: &'a MotorState,

    in_flight: Option<InFlight>,
    last_cycle: Option<u64>,
}

impl<'a> StrideCursor<'a> {
    pub(crate) fn new(
        segment: &'a mut CycleSegment,
        buffer: &'a mut CycleResultSegmentBuffer,
        cycle_limiter: Option<&'a RateLimiter>,
        activity: &'a Activity,
        state: &'a MotorState,
    ) -> Self {
        Self {
            segment,
            buffer,
            cycle_limiter,
            activity,
            state,
            in_flight: None,
            last_cycle: None,
        }
    }

    /// Starts the next cycle of the stride.
    ///
    /// Returns `None` when the stride is exhausted or the motor or its activity is stopping. In
    /// the latter case the remaining cycles are abandoned.
    pub fn next_cycle(&mut self) -> Option<u64> {
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                cycle = in_flight.cycle,
                "cycle was not completed before the next one started, recording it as skipped"
            );
            self.buffer.append(in_flight.cycle, crate::SKIPPED);
            self.activity.instrumentation().record_skipped(1);
        }

        if self.state.get() != Some(RunState::Running) || self.activity.is_stop_requested() {
            return None;
        }

        let cycle = self.segment.next_cycle()?;
        let delay = match self.cycle_limiter {
            Some(limiter) => {
                let delay = limiter.block();
                self.activity.instrumentation().record_cycle_delay(delay);
                delay
            }
            None => Duration::ZERO,
        };

        self.in_flight = Some(InFlight {
            cycle,
            started: Instant::now(),
            delay,
        });
        self.last_cycle = Some(cycle);

        Some(cycle)
    }

    /// Records the result of the cycle most recently returned by
    /// [`next_cycle()`][Self::next_cycle].
    pub fn complete(&mut self, result: i32) {
        let Some(in_flight) = self.in_flight.take() else {
            warn!("result reported without a cycle in flight, ignoring it");
            return;
        };

        self.activity
            .instrumentation()
            .record_cycle(in_flight.started.elapsed().saturating_add(in_flight.delay));
        self.buffer.append(in_flight.cycle, result_code(result));
    }

    /// The number of cycles of the stride not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.segment.remaining()
    }

    /// Stops the service timer of the in-flight cycle without recording a result, returning the
    /// cycle the failure is attributed to.
    pub(crate) fn fail(&mut self) -> u64 {
        match self.in_flight.take() {
            Some(in_flight) => {
                self.activity
                    .instrumentation()
                    .record_failed(in_flight.started.elapsed().saturating_add(in_flight.delay));
                in_flight.cycle
            }
            None => self
                .last_cycle
                .or_else(|| self.segment.peek_next_cycle())
                .unwrap_or_default(),
        }
    }

    /// Releases the cursor, recording a cycle left in flight as skipped.
    pub(crate) fn finish(mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                cycle = in_flight.cycle,
                "stride ended with a cycle in flight, recording it as skipped"
            );
            self.buffer.append(in_flight.cycle, crate::SKIPPED);
            self.activity.instrumentation().record_skipped(1);
        }
    }
}

impl fmt::Debug for StrideCursor<'_> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrideCursor")
            .field("segment", &self.segment)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}
