use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{Activity, ActivityDef, Error, MotorHandle, Result, RunState, RunStateImage};

/// The threads executing the motors of one activity.
///
/// Created by [`Activity::start()`]. Each motor runs on its own named thread. The number of
/// threads follows the `threads` parameter, including when it changes through
/// [`update_def()`][Self::update_def] while the activity runs.
pub struct ActivityExecution {
    activity: Activity,
    motors: Mutex<Vec<MotorThread>>,
    started: Instant,
}

struct MotorThread {
    handle: MotorHandle,
    thread: JoinHandle<Result<()>>,
}

/// How an activity execution ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct ExecutionSummary {
    /// Motors that ran until the input was exhausted.
    pub finished: usize,

    /// Motors that were stopped before the input was exhausted.
    pub stopped: usize,

    /// Time from the start of the execution until every motor thread ended.
    pub elapsed: Duration,
}

impl Activity {
    /// Starts one motor thread per configured thread.
    ///
    /// # Errors
    ///
    /// Returns an error if a motor cannot be created, e.g. because the activity has no action
    /// factory, or if a thread cannot be spawned. Motors started before the failure are asked to
    /// stop.
    pub fn start(&self) -> Result<ActivityExecution> {
        let execution = ActivityExecution {
            activity: self.clone(),
            motors: Mutex::new(Vec::new()),
            started: Instant::now(),
        };

        info!(alias = self.def().alias(), "starting activity");

        if let Err(e) = execution.align_threads() {
            execution.request_stop();
            return Err(e);
        }

        Ok(execution)
    }
}

impl ActivityExecution {
    /// The activity being executed.
    #[must_use]
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Handles of every motor started so far, including ones that already ended.
    #[must_use]
    pub fn motors(&self) -> Vec<MotorHandle> {
        self.motors
            .lock()
            .iter()
            .map(|motor| motor.handle.clone())
            .collect()
    }

    /// A snapshot of the run states of all motors.
    #[must_use]
    pub fn image(&self) -> RunStateImage {
        self.activity.tally().image()
    }

    /// Asks every motor to stop, including motors that are still starting.
    pub fn request_stop(&self) {
        info!(alias = self.activity.def().alias(), "stopping activity");

        self.activity.request_stop();

        for motor in self.motors.lock().iter() {
            if motor.handle.state() == Some(RunState::Running) {
                motor.handle.request_stop();
            }
        }
    }

    /// Replaces the activity definition and adjusts the number of motor threads to match it.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or additional motors cannot be started.
    pub fn update_def(&self, def: ActivityDef) -> Result<()> {
        self.activity.update_def(def)?;
        self.align_threads()
    }

    /// Sets one parameter of the activity definition; see [`update_def()`][Self::update_def].
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting definition is invalid or additional motors cannot be
    /// started.
    pub fn set_param(&self, key: impl Into<String>, value: impl ToString) -> Result<()> {
        self.activity.set_param(key, value)?;
        self.align_threads()
    }

    fn align_threads(&self) -> Result<()> {
        let wanted = self.activity.def().threads()?.get();
        let mut motors = self.motors.lock();

        let active: Vec<&MotorThread> = motors
            .iter()
            .filter(|motor| {
                !motor.handle.is_retiring()
                    && !motor
                        .handle
                        .state()
                        .is_some_and(|state| state.is_terminal() || state == RunState::Stopping)
            })
            .collect();

        if active.len() > wanted {
            for motor in active.iter().rev().take(active.len().saturating_sub(wanted)) {
                debug!(motor = %motor.handle, "retiring surplus motor");
                motor.handle.retire();
            }
            return Ok(());
        }

        let missing = wanted.saturating_sub(active.len());
        drop(active);

        if self.activity.is_stop_requested() {
            return Ok(());
        }

        for _ in 0..missing {
            let slot = motors.len();
            motors.push(self.spawn_motor(slot)?);
        }

        Ok(())
    }

    fn spawn_motor(&self, slot: usize) -> Result<MotorThread> {
        let mut motor = self.activity.new_motor(slot)?;
        let handle = motor.handle();
        let activity = self.activity.clone();

        let thread = thread::Builder::new()
            .name(format!("{}-motor-{slot}", activity.def().alias()))
            .spawn(move || {
                let result = motor.run();

                // One failed motor fails the whole activity, so the others need not keep going.
                if result.is_err() {
                    activity.request_stop();
                }

                result
            })?;

        debug!(motor = %handle, "motor thread spawned");

        Ok(MotorThread { handle, thread })
    }

    /// Waits for every motor thread to end, then closes the output.
    ///
    /// # Errors
    ///
    /// Returns the failure of the first motor that failed, in slot order, with the component's
    /// original error as its source. Returns [`Error::MotorPanicked`] if a motor thread panicked
    /// and [`Error::OutputClose`] if the output fails to close.
    pub fn await_completion(self) -> Result<ExecutionSummary> {
        let mut first_error = None;

        for motor in self.motors.into_inner() {
            let slot = motor.handle.slot();

            let outcome = motor
                .thread
                .join()
                .unwrap_or(Err(Error::MotorPanicked { slot }));

            if let Err(e) = outcome {
                error!(slot, error = %e, "motor ended with an error");
                first_error.get_or_insert(e);
            }
        }

        if let Some(output) = self.activity.output() {
            output
                .close()
                .map_err(|source| Error::OutputClose { source })?;
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let image = self.activity.tally().image();
        let summary = ExecutionSummary {
            finished: image.count(RunState::Finished),
            stopped: image.count(RunState::Stopped),
            elapsed: self.started.elapsed(),
        };

        info!(
            alias = self.activity.def().alias(),
            finished = summary.finished,
            stopped = summary.stopped,
            elapsed = ?summary.elapsed,
            "activity completed"
        );

        Ok(summary)
    }
}

impl fmt::Debug for ActivityExecution {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityExecution")
            .field("activity", &self.activity)
            .field("motors", &self.motors())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{BoxError, MotorAction};

    assert_impl_all!(ActivityExecution: Send, Sync);

    fn activity(def: &str, action: fn(u64) -> std::result::Result<i32, BoxError>) -> Activity {
        Activity::builder(def.parse().unwrap())
            .action(move |_slot| MotorAction::sync(action))
            .build()
            .unwrap()
    }

    #[test]
    fn runs_every_thread_to_completion() {
        let activity = activity("cycles=100;threads=3;stride=7", |_| Ok(0));

        let summary = activity.start().unwrap().await_completion().unwrap();

        assert_eq!(summary.finished, 3);
        assert_eq!(summary.stopped, 0);
        assert_eq!(activity.instrumentation().cycles_completed().get(), 100);
    }

    #[test]
    fn first_motor_error_is_returned() {
        let activity = activity("cycles=1000;threads=2", |cycle| {
            if cycle == 500 {
                return Err("boom".into());
            }
            Ok(0)
        });

        let error = activity.start().unwrap().await_completion().unwrap_err();

        assert!(matches!(error, Error::Action { cycle: 500, .. }));
        assert_eq!(activity.tally().tally(RunState::Errored), 1);
        assert!(activity.is_stop_requested());
    }

    #[test]
    fn missing_factory_fails_to_start() {
        let activity = Activity::builder("cycles=5".parse().unwrap())
            .build()
            .unwrap();

        assert!(matches!(
            activity.start(),
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn stop_ends_unbounded_activity() {
        let activity = activity("cycles=1T;threads=2", |_| {
            thread::sleep(Duration::from_micros(100));
            Ok(0)
        });

        let execution = activity.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        execution.request_stop();

        let summary = execution.await_completion().unwrap();

        assert_eq!(summary.stopped, 2);
        assert_eq!(summary.finished, 0);
    }

    #[test]
    fn thread_count_follows_def() {
        let activity = activity("cycles=1T;threads=1", |_| {
            thread::sleep(Duration::from_micros(100));
            Ok(0)
        });

        let execution = activity.start().unwrap();
        assert_eq!(execution.motors().len(), 1);

        execution.set_param("threads", 3).unwrap();
        assert_eq!(execution.motors().len(), 3);

        execution.set_param("threads", 2).unwrap();
        let image = activity
            .tally()
            .await_any(Duration::from_secs(10), &[RunState::Stopped]);
        assert!(!image.is_timeout());

        execution.request_stop();
        let summary = execution.await_completion().unwrap();

        assert_eq!(summary.stopped, 3);
    }
}
