use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use derive_more::Display;
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

/// The lifecycle state of a motor.
///
/// ```text
/// Starting -> Running -> Finished
///                     -> Stopping -> Stopped
/// (any) -> Errored
/// ```
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[repr(u8)]
#[non_exhaustive]
pub enum RunState {
    /// Performing one-time setup before the first segment.
    Starting = 0,

    /// Executing cycles.
    Running = 1,

    /// A stop was requested. The motor will finish its current cycle and then stop.
    Stopping = 2,

    /// Stopped on request. Terminal.
    Stopped = 3,

    /// The input was exhausted. Terminal.
    Finished = 4,

    /// The action or the output failed. Terminal.
    Errored = 5,
}

const STATE_COUNT: usize = 6;

/// Encoding of "no state entered yet" in [`MotorState`].
const NO_STATE: u8 = u8::MAX;

impl RunState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; STATE_COUNT] = [
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Finished,
        Self::Errored,
    ];

    /// Whether no further transitions are possible from this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Finished | Self::Errored)
    }

    /// Whether a motor in this state may move to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (_, Self::Errored) => !self.is_terminal(),
            (Self::Starting, Self::Running)
            | (Self::Running, Self::Stopping | Self::Finished)
            | (Self::Stopping, Self::Stopped) => true,
            _ => false,
        }
    }

    fn index(self) -> usize {
        usize::from(self as u8)
    }

    fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|state| *state as u8 == value)
    }
}

/// Counts how many motors of an activity are in each [`RunState`].
///
/// Motors publish every state change here, so observers can wait for aggregate conditions such
/// as "no motor is running anymore" without touching individual motors.
#[derive(Debug, Default)]
pub struct RunStateTally {
    counts: Mutex<[usize; STATE_COUNT]>,
    changed: Condvar,
}

impl RunStateTally {
    /// Creates a tally with all counts at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of motors currently in `state`.
    #[must_use]
    pub fn tally(&self, state: RunState) -> usize {
        self.counts
            .lock()
            .get(state.index())
            .copied()
            .unwrap_or_default()
    }

    /// A snapshot of all counts.
    #[must_use]
    pub fn image(&self) -> RunStateImage {
        RunStateImage {
            counts: *self.counts.lock(),
            timed_out: false,
        }
    }

    pub(crate) fn add(&self, state: RunState) {
        self.update(|counts| increment(counts, state));
    }

    pub(crate) fn change(&self, from: RunState, to: RunState) {
        self.update(|counts| {
            decrement(counts, from);
            increment(counts, to);
        });
    }

    fn update(&self, f: impl FnOnce(&mut [usize; STATE_COUNT])) {
        let mut counts = self.counts.lock();
        f(&mut counts);
        drop(counts);

        self.changed.notify_all();
    }

    /// Waits until at least one motor is in any of `states`.
    ///
    /// Returns the counts at the time the condition was met or the timeout expired.
    #[must_use]
    pub fn await_any(&self, timeout: Duration, states: &[RunState]) -> RunStateImage {
        self.await_condition(timeout, |image| states.iter().any(|s| image.count(*s) > 0))
    }

    /// Waits until no motor is in any of `states`.
    #[must_use]
    pub fn await_none_of(&self, timeout: Duration, states: &[RunState]) -> RunStateImage {
        self.await_condition(timeout, |image| states.iter().all(|s| image.count(*s) == 0))
    }

    /// Waits until every motor is in one of `states`.
    #[must_use]
    pub fn await_none_other(&self, timeout: Duration, states: &[RunState]) -> RunStateImage {
        self.await_condition(timeout, |image| {
            RunState::ALL
                .iter()
                .filter(|s| !states.contains(s))
                .all(|s| image.count(*s) == 0)
        })
    }

    fn await_condition(
        &self,
        timeout: Duration,
        condition: impl Fn(&RunStateImage) -> bool,
    ) -> RunStateImage {
        let deadline = Instant::now().checked_add(timeout);
        let mut counts = self.counts.lock();

        loop {
            let image = RunStateImage {
                counts: *counts,
                timed_out: false,
            };

            if condition(&image) {
                return image;
            }

            let timed_out = match deadline {
                Some(deadline) => self.changed.wait_until(&mut counts, deadline).timed_out(),
                None => {
                    self.changed.wait(&mut counts);
                    false
                }
            };

            if timed_out {
                let image = RunStateImage {
                    counts: *counts,
                    timed_out: false,
                };

                let met = condition(&image);
                return RunStateImage {
                    timed_out: !met,
                    ..image
                };
            }
        }
    }
}

fn increment(counts: &mut [usize; STATE_COUNT], state: RunState) {
    if let Some(count) = counts.get_mut(state.index()) {
        *count = count.saturating_add(1);
    }
}

fn decrement(counts: &mut [usize; STATE_COUNT], state: RunState) {
    if let Some(count) = counts.get_mut(state.index()) {
        *count = count.saturating_sub(1);
    }
}

/// A snapshot of a [`RunStateTally`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunStateImage {
    counts: [usize; STATE_COUNT],
    timed_out: bool,
}

impl RunStateImage {
    /// The number of motors that were in `state`.
    #[must_use]
    pub fn count(&self, state: RunState) -> usize {
        self.counts.get(state.index()).copied().unwrap_or_default()
    }

    /// The total number of motors.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Whether the wait that produced this image gave up before its condition was met.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    /// The furthest-along state any motor was in, in lifecycle order.
    #[must_use]
    pub fn max_state(&self) -> Option<RunState> {
        RunState::ALL
            .into_iter()
            .rev()
            .find(|state| self.count(*state) > 0)
    }
}

impl fmt::Display for RunStateImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for state in RunState::ALL {
            let count = self.count(state);
            if count == 0 {
                continue;
            }

            if !first {
                f.write_str(" ")?;
            }
            first = false;

            write!(f, "{state}:{count}")?;
        }

        if self.timed_out {
            f.write_str(" (timed out)")?;
        }

        Ok(())
    }
}

/// The state of one motor, mirrored into the activity-wide [`RunStateTally`].
///
/// Transitions are atomic compare-and-swap operations, so a stop request from another thread and
/// the motor's own transitions cannot overwrite each other.
#[derive(Debug)]
pub struct MotorState {
    slot: usize,
    state: AtomicU8,
    tally: Arc<RunStateTally>,
}

impl MotorState {
    /// Creates the state for the motor in `slot`. No state is entered yet.
    #[must_use]
    pub fn new(slot: usize, tally: Arc<RunStateTally>) -> Self {
        Self {
            slot,
            state: AtomicU8::new(NO_STATE),
            tally,
        }
    }

    /// The current state, or `None` before the motor has started.
    #[must_use]
    pub fn get(&self) -> Option<RunState> {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The worker slot of the motor.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Enters `Starting`. Only valid as the first state.
    pub(crate) fn start(&self) -> bool {
        let entered = self
            .state
            .compare_exchange(
                NO_STATE,
                RunState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if entered {
            self.tally.add(RunState::Starting);
            trace!(slot = self.slot, "motor entered Starting");
        } else {
            warn!(slot = self.slot, current = ?self.get(), "motor was already started");
        }

        entered
    }

    /// Moves from `from` to `to` if the motor is still in `from`.
    pub(crate) fn transition(&self, from: RunState, to: RunState) -> bool {
        if !from.can_transition_to(to) {
            warn!(slot = self.slot, %from, %to, "refusing invalid motor state transition");
            return false;
        }

        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if moved {
            self.tally.change(from, to);
            trace!(slot = self.slot, %from, %to, "motor state changed");
        }

        moved
    }

    /// Moves to `Errored` from whatever non-terminal state the motor is in.
    pub(crate) fn error(&self) {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let Some(from) = RunState::from_u8(current) else {
                // Never started: count it as having gone straight to Errored.
                match self.state.compare_exchange(
                    current,
                    RunState::Errored as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.tally.add(RunState::Errored);
                        return;
                    }
                    Err(actual) => {
                        current = actual;
                        continue;
                    }
                }
            };

            if from.is_terminal() {
                warn!(slot = self.slot, %from, "motor failed after reaching a terminal state");
                return;
            }

            match self.state.compare_exchange(
                current,
                RunState::Errored as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.tally.change(from, RunState::Errored);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(RunStateTally: Send, Sync);
    assert_impl_all!(MotorState: Send, Sync);

    #[test]
    fn transition_rules() {
        assert!(RunState::Starting.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Stopping));
        assert!(RunState::Running.can_transition_to(RunState::Finished));
        assert!(RunState::Stopping.can_transition_to(RunState::Stopped));
        assert!(RunState::Stopping.can_transition_to(RunState::Errored));

        assert!(!RunState::Starting.can_transition_to(RunState::Stopping));
        assert!(!RunState::Stopping.can_transition_to(RunState::Finished));
        assert!(!RunState::Finished.can_transition_to(RunState::Errored));
        assert!(!RunState::Stopped.can_transition_to(RunState::Running));
    }

    #[test]
    fn states_are_published_to_tally() {
        let tally = Arc::new(RunStateTally::new());
        let a = MotorState::new(0, Arc::clone(&tally));
        let b = MotorState::new(1, Arc::clone(&tally));

        assert!(a.start());
        assert!(b.start());
        assert_eq!(tally.tally(RunState::Starting), 2);

        assert!(a.transition(RunState::Starting, RunState::Running));
        assert_eq!(tally.tally(RunState::Starting), 1);
        assert_eq!(tally.tally(RunState::Running), 1);

        b.error();
        assert_eq!(b.get(), Some(RunState::Errored));
        assert_eq!(tally.image().to_string(), "Running:1 Errored:1");
        assert_eq!(tally.image().total(), 2);
    }

    #[test]
    fn stale_transition_is_refused() {
        let tally = Arc::new(RunStateTally::new());
        let state = MotorState::new(0, Arc::clone(&tally));
        state.start();
        state.transition(RunState::Starting, RunState::Running);
        state.transition(RunState::Running, RunState::Stopping);

        assert!(!state.transition(RunState::Running, RunState::Finished));
        assert_eq!(state.get(), Some(RunState::Stopping));
        assert!(!state.start());
    }

    #[test]
    fn error_from_terminal_state_is_ignored() {
        let tally = Arc::new(RunStateTally::new());
        let state = MotorState::new(0, Arc::clone(&tally));
        state.start();
        state.transition(RunState::Starting, RunState::Running);
        state.transition(RunState::Running, RunState::Finished);

        state.error();

        assert_eq!(state.get(), Some(RunState::Finished));
        assert_eq!(tally.tally(RunState::Errored), 0);
    }

    #[test]
    fn error_before_start_is_counted() {
        let tally = Arc::new(RunStateTally::new());
        let state = MotorState::new(0, Arc::clone(&tally));

        state.error();

        assert_eq!(state.get(), Some(RunState::Errored));
        assert_eq!(tally.tally(RunState::Errored), 1);
    }

    #[test]
    fn image_reports_max_state() {
        let tally = RunStateTally::new();
        tally.add(RunState::Running);
        tally.add(RunState::Finished);

        assert_eq!(tally.image().max_state(), Some(RunState::Finished));
        assert_eq!(RunStateTally::new().image().max_state(), None);
    }

    #[test]
    fn await_times_out() {
        let tally = RunStateTally::new();
        tally.add(RunState::Running);

        let image = tally.await_none_of(Duration::from_millis(10), &[RunState::Running]);

        assert!(image.is_timeout());
        assert_eq!(image.count(RunState::Running), 1);
    }

    #[test]
    fn await_already_satisfied_returns_immediately() {
        let tally = RunStateTally::new();
        tally.add(RunState::Finished);

        let image = tally.await_none_other(Duration::ZERO, &[RunState::Finished]);

        assert!(!image.is_timeout());
    }

    #[test]
    #[cfg_attr(miri, ignore = "waits on a real clock")]
    fn await_observes_changes_from_other_threads() {
        let tally = Arc::new(RunStateTally::new());
        tally.add(RunState::Running);

        let changer = thread::spawn({
            let tally = Arc::clone(&tally);
            move || {
                thread::sleep(Duration::from_millis(10));
                tally.change(RunState::Running, RunState::Finished);
            }
        });

        let image = tally.await_any(Duration::from_secs(5), &[RunState::Finished]);

        assert!(!image.is_timeout());
        assert_eq!(image.count(RunState::Finished), 1);
        changer.join().unwrap();
    }
}
