use std::fmt;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::tracker::{OpTracker, StrideTracker, skip_untracked};
use crate::{
    Activity, ActivityDef, ActivityDefObserver, CycleResultSegmentBuffer, CycleSegment, Error,
    MotorAction, MotorState, RateLimiter, Result, RunState, SKIPPED, StrideCursor, TrackedOp,
};

/// How long a finishing motor waits for its asynchronous operations before it warns and keeps
/// waiting.
const ASYNC_DRAIN_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// State shared between a motor and the handles that control it from other threads.
#[derive(Debug)]
struct MotorControl {
    state: MotorState,

    // Set when the activity definition changed; the motor reloads its settings at the next
    // stride boundary.
    def_changed: AtomicBool,

    // Set when the owner wants this motor gone even if it is still starting.
    retire_requested: AtomicBool,
}

impl ActivityDefObserver for MotorControl {
    fn on_activity_def_update(&self, _def: &ActivityDef) {
        self.def_changed.store(true, Ordering::Release);
    }
}

/// Drives one action over the cycles of an activity, on the thread that calls [`run()`].
///
/// The motor repeatedly draws a stride-sized segment from the activity's input, paces it with
/// the stride and cycle rate limiters, executes every cycle with its action and forwards the
/// stride's results to the activity's output. It stops when the input is exhausted, when a stop
/// is requested or when the action or output fails.
///
/// Any failure is fatal: the motor enters [`RunState::Errored`] and `run()` returns the failure
/// with the component's original error as its source.
///
/// [`run()`]: Self::run
pub struct Motor {
    activity: Activity,
    control: Arc<MotorControl>,
    action: MotorAction,

    stride: NonZero<usize>,
    stride_limiter: Option<Arc<RateLimiter>>,
    cycle_limiter: Option<Arc<RateLimiter>>,

    buffer: CycleResultSegmentBuffer,

    // Present exactly when the action is asynchronous.
    ops: Option<Arc<OpTracker>>,
}

impl Motor {
    /// Creates a motor for `slot` of `activity`, driving `action`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the action does not support the execution path
    /// selected by the `async` parameter, or a parameter error if the activity definition is
    /// invalid.
    pub fn new(activity: &Activity, slot: usize, action: MotorAction) -> Result<Self> {
        let def = activity.def();

        let ops = match (action.is_async(), def.async_limit()?) {
            (true, Some(limit)) => Some(Arc::new(OpTracker::new(limit))),
            (false, None) => None,
            (true, None) => {
                return Err(Error::invalid_configuration(
                    "the action only supports asynchronous execution but the 'async' parameter is not set",
                ));
            }
            (false, Some(_)) => {
                return Err(Error::invalid_configuration(
                    "the 'async' parameter is set but the action does not support asynchronous execution",
                ));
            }
        };

        let stride = def.stride()?;

        let control = Arc::new(MotorControl {
            state: MotorState::new(slot, Arc::clone(activity.tally())),
            def_changed: AtomicBool::new(false),
            retire_requested: AtomicBool::new(false),
        });

        let observer: Arc<dyn ActivityDefObserver> = control.clone();
        activity.register_observer(Arc::downgrade(&observer));

        Ok(Self {
            activity: activity.clone(),
            control,
            action,
            stride,
            stride_limiter: activity.stride_limiter(),
            cycle_limiter: activity.cycle_limiter(),
            buffer: CycleResultSegmentBuffer::with_capacity(stride.get()),
            ops,
        })
    }

    /// A handle for observing and stopping this motor from other threads.
    #[must_use]
    pub fn handle(&self) -> MotorHandle {
        MotorHandle {
            control: Arc::clone(&self.control),
            alias: self.activity.def().alias().to_string(),
        }
    }

    /// The current state, or `None` before [`run()`][Self::run] is called.
    #[must_use]
    pub fn state(&self) -> Option<RunState> {
        self.control.state.get()
    }

    /// The worker slot of this motor within its activity.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.control.state.slot()
    }

    /// The activity this motor belongs to.
    #[must_use]
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Requests a stop; see [`MotorHandle::request_stop()`].
    pub fn request_stop(&self) {
        request_stop(&self.control, self.activity.def().alias());
    }

    /// Runs the motor on the current thread until it finishes, stops or fails.
    ///
    /// A motor can only be run once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionInit`] or [`Error::Action`] if the action fails and
    /// [`Error::Output`] if the output rejects a result segment. The motor is then in
    /// [`RunState::Errored`]. Running a motor a second time is an
    /// [`Error::InvalidConfiguration`].
    pub fn run(&mut self) -> Result<()> {
        if !self.control.state.start() {
            return Err(Error::invalid_configuration("a motor can only be run once"));
        }

        let result = self.run_started();

        if let Err(e) = &result {
            self.control.state.error();
            error!(motor = %self, error = %e, "motor failed");
        }

        result
    }

    fn run_started(&mut self) -> Result<()> {
        self.action
            .init()
            .map_err(|source| Error::ActionInit { source })?;

        self.activity.input().start();

        if let Some(limiter) = &self.stride_limiter {
            limiter.block();
        }

        if !self
            .control
            .state
            .transition(RunState::Starting, RunState::Running)
        {
            return Err(Error::invalid_configuration(
                "motor left the Starting state unexpectedly",
            ));
        }

        debug!(motor = %self, "motor running");

        while self.control.state.get() == Some(RunState::Running) {
            self.check_stop_signals();
            if self.control.state.get() != Some(RunState::Running) {
                break;
            }

            if self.control.def_changed.swap(false, Ordering::AcqRel) {
                self.reload_settings();
            }

            if let Some(failure) = self.ops.as_ref().and_then(|ops| ops.take_failure()) {
                return Err(failure);
            }

            let input_started = Instant::now();
            let segment = self.activity.input().get_input_segment(self.stride);
            self.activity
                .instrumentation()
                .record_input(input_started.elapsed());

            let Some(segment) = segment else {
                self.drain_async()?;

                if self
                    .control
                    .state
                    .transition(RunState::Running, RunState::Finished)
                {
                    info!(motor = %self, "motor finished, input exhausted");
                    return Ok(());
                }

                // A stop request raced with the end of the input.
                break;
            };

            let stride_delay = match self.stride_limiter.as_deref() {
                Some(limiter) => {
                    let delay = limiter.block();
                    self.activity.instrumentation().record_stride_delay(delay);
                    delay
                }
                None => Duration::ZERO,
            };

            if self.ops.is_some() {
                self.run_async_stride(segment, stride_delay)?;
            } else {
                self.run_stride(segment, stride_delay)?;
            }
        }

        self.drain_async()?;

        if self
            .control
            .state
            .transition(RunState::Stopping, RunState::Stopped)
        {
            info!(motor = %self, "motor stopped");
        }

        Ok(())
    }

    fn check_stop_signals(&self) {
        if self.activity.is_stop_requested()
            || self.control.retire_requested.load(Ordering::Acquire)
        {
            self.control
                .state
                .transition(RunState::Running, RunState::Stopping);
        }
    }

    fn reload_settings(&mut self) {
        let def = self.activity.def();

        match def.stride() {
            Ok(stride) => {
                if stride != self.stride {
                    debug!(motor = %self, old = %self.stride, new = %stride, "stride changed");
                }
                self.stride = stride;
                self.buffer.ensure_capacity(stride.get());
            }
            Err(e) => warn!(motor = %self, error = %e, "keeping previous stride"),
        }

        self.stride_limiter = self.activity.stride_limiter();
        self.cycle_limiter = self.activity.cycle_limiter();
        self.action.on_activity_def_update(&def);
    }

    /// Executes a stride on the motor thread with a synchronous or stride action.
    fn run_stride(&mut self, mut segment: CycleSegment, stride_delay: Duration) -> Result<()> {
        let stride_started = Instant::now();
        let instrumentation = self.activity.instrumentation();

        let mut cursor = StrideCursor::new(
            &mut segment,
            &mut self.buffer,
            self.cycle_limiter.as_deref(),
            &self.activity,
            &self.control.state,
        );

        match &mut self.action {
            MotorAction::Sync(action) => {
                while let Some(cycle) = cursor.next_cycle() {
                    match action.run_cycle(cycle) {
                        Ok(result) => cursor.complete(result),
                        Err(source) => {
                            cursor.fail();
                            return Err(Error::Action { cycle, source });
                        }
                    }
                }
            }
            MotorAction::Stride(action) => {
                if let Err(source) = action.run_stride(&mut cursor) {
                    let cycle = cursor.fail();
                    return Err(Error::Action { cycle, source });
                }
            }
            MotorAction::Async(_) => {
                return Err(Error::invalid_configuration(
                    "asynchronous action on the synchronous execution path",
                ));
            }
        }

        cursor.finish();

        let abandoned = segment.abandon();
        if !abandoned.is_empty() {
            debug!(motor = %self, cycles = ?abandoned, "abandoning cycles of stopped stride");
            instrumentation.record_skipped(abandoned.end.saturating_sub(abandoned.start));
            for cycle in abandoned {
                self.buffer.append(cycle, SKIPPED);
            }
        }

        instrumentation.record_stride(stride_started.elapsed().saturating_add(stride_delay));

        self.forward_results(segment.recycle())
    }

    fn forward_results(&mut self, recycle: u64) -> Result<()> {
        let Some(output) = self.activity.output() else {
            self.buffer.reset();
            return Ok(());
        };

        if self.buffer.is_empty() {
            return Ok(());
        }

        let segment = self.buffer.to_reader();
        self.buffer.reset();

        output
            .on_recycle_result_segment(recycle, &segment)
            .map_err(|source| Error::Output {
                min_cycle: segment.min_cycle().unwrap_or_default(),
                source,
            })
    }

    /// Hands every cycle of a stride to the asynchronous action.
    fn run_async_stride(
        &mut self,
        mut segment: CycleSegment,
        stride_delay: Duration,
    ) -> Result<()> {
        let Some(ops) = self.ops.clone() else {
            return Err(Error::invalid_configuration(
                "synchronous action on the asynchronous execution path",
            ));
        };
        let MotorAction::Async(action) = &mut self.action else {
            return Err(Error::invalid_configuration(
                "synchronous action on the asynchronous execution path",
            ));
        };

        let Some(min_cycle) = segment.peek_next_cycle() else {
            return Ok(());
        };

        let stride = Arc::new(StrideTracker::new(
            self.activity.clone(),
            Arc::clone(&ops),
            segment.recycle(),
            min_cycle,
            usize::try_from(segment.remaining()).unwrap_or(usize::MAX),
            stride_delay,
        ));

        let state = &self.control.state;
        let activity = &self.activity;
        let is_running =
            || state.get() == Some(RunState::Running) && !activity.is_stop_requested();

        while !segment.is_exhausted() && is_running() {
            if !ops.acquire(is_running) {
                break;
            }

            let Some(cycle) = segment.next_cycle() else {
                ops.release();
                break;
            };

            let delay = match self.cycle_limiter.as_deref() {
                Some(limiter) => {
                    let delay = limiter.block();
                    activity.instrumentation().record_cycle_delay(delay);
                    delay
                }
                None => Duration::ZERO,
            };

            let op = TrackedOp::new(cycle, delay, Arc::clone(&stride), Arc::clone(&ops));

            if let Err(source) = action.enqueue(op) {
                return Err(Error::Action { cycle, source });
            }
        }

        let abandoned = segment.abandon();
        if !abandoned.is_empty() {
            debug!(slot = state.slot(), cycles = ?abandoned, "abandoning cycles of stopped stride");
            for cycle in abandoned {
                skip_untracked(&stride, cycle);
            }
        }

        Ok(())
    }

    /// Waits for all asynchronous operations to report their outcome.
    fn drain_async(&self) -> Result<()> {
        let Some(ops) = &self.ops else {
            return Ok(());
        };

        while !ops.await_idle(ASYNC_DRAIN_WARN_INTERVAL) {
            warn!(
                motor = %self,
                pending = ops.pending(),
                "still waiting for asynchronous operations to complete"
            );
        }

        ops.take_failure().map_or(Ok(()), Err)
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_motor(f, self.activity.def().alias(), &self.control.state)
    }
}

impl fmt::Debug for Motor {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Motor")
            .field("slot", &self.slot())
            .field("state", &self.state())
            .field("action", &self.action)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

fn write_motor(f: &mut fmt::Formatter<'_>, alias: &str, state: &MotorState) -> fmt::Result {
    match state.get() {
        Some(current) => write!(f, "{alias}: slot:{}; state:{current}", state.slot()),
        None => write!(f, "{alias}: slot:{}; state:-", state.slot()),
    }
}

fn request_stop(control: &MotorControl, alias: &str) {
    if control
        .state
        .transition(RunState::Running, RunState::Stopping)
    {
        debug!(alias, slot = control.state.slot(), "motor stop requested");
    } else {
        warn!(
            alias,
            slot = control.state.slot(),
            state = ?control.state.get(),
            "ignoring stop request for motor that is not running"
        );
    }
}

/// Observes and controls a [`Motor`] from any thread.
#[derive(Clone)]
pub struct MotorHandle {
    control: Arc<MotorControl>,
    alias: String,
}

impl MotorHandle {
    /// Asks the motor to stop after the cycle it is executing.
    ///
    /// The motor moves to [`RunState::Stopping`] immediately and to [`RunState::Stopped`] once
    /// its current cycle completes. Cycles of its current stride that were not started are
    /// abandoned and reported as skipped. Has no effect, apart from a warning, unless the
    /// motor is [`RunState::Running`].
    pub fn request_stop(&self) {
        request_stop(&self.control, &self.alias);
    }

    /// The current state, or `None` before the motor starts.
    #[must_use]
    pub fn state(&self) -> Option<RunState> {
        self.control.state.get()
    }

    /// The worker slot of the motor.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.control.state.slot()
    }

    /// Stops the motor as soon as it is running, even if it is still starting now.
    pub(crate) fn retire(&self) {
        self.control.retire_requested.store(true, Ordering::Release);
        self.control
            .state
            .transition(RunState::Running, RunState::Stopping);
    }

    pub(crate) fn is_retiring(&self) -> bool {
        self.control.retire_requested.load(Ordering::Acquire)
    }
}

impl ActivityDefObserver for MotorHandle {
    /// Makes the motor reload its settings from its activity at the next stride boundary.
    ///
    /// Motors are notified automatically when their own activity's definition changes; this is
    /// for owners that manage definitions themselves.
    fn on_activity_def_update(&self, def: &ActivityDef) {
        self.control.on_activity_def_update(def);
    }
}

impl fmt::Display for MotorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_motor(f, &self.alias, &self.control.state)
    }
}

impl fmt::Debug for MotorHandle {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotorHandle")
            .field("alias", &self.alias)
            .field("slot", &self.slot())
            .field("state", &self.state())
            .finish()
    }
}
