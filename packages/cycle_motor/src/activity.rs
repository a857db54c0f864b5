use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    ActivityDef, ActivityDefObserver, ActivityInstrumentation, AtomicInput, Error, Input, Motor,
    MotorAction, Output, RateLimiter, RateSpec, Result, RunStateTally,
};

type ActionFactory = dyn Fn(usize) -> MotorAction + Send + Sync;

/// One configured workload: the definition, the components and the state its motors share.
///
/// An activity is a cheap handle; clones refer to the same activity. Every motor of the activity
/// shares its input, output, rate limiters, instrumentation and run state tally.
///
/// The definition can be changed while motors run with [`update_def()`][Self::update_def]. The
/// change is broadcast to the input, the output, every registered observer and every motor,
/// which picks it up at its next stride boundary. Rate limiters are reconfigured in place, so
/// even threads blocked in a limiter observe the new rate immediately.
#[derive(Clone)]
pub struct Activity {
    inner: Arc<ActivityInner>,
}

struct ActivityInner {
    def: ArcSwap<ActivityDef>,

    input: Arc<dyn Input>,
    output: Option<Arc<dyn Output>>,
    action_factory: Option<Box<ActionFactory>>,

    stride_limiter: ArcSwapOption<RateLimiter>,
    cycle_limiter: ArcSwapOption<RateLimiter>,

    instrumentation: ActivityInstrumentation,
    tally: Arc<RunStateTally>,

    observers: Mutex<Vec<Weak<dyn ActivityDefObserver>>>,
    stop_requested: AtomicBool,

    // Serializes definition updates so observers see them in the order they were applied.
    update_lock: Mutex<()>,
}

impl Activity {
    /// Starts building an activity from its definition.
    #[must_use]
    pub fn builder(def: ActivityDef) -> ActivityBuilder {
        ActivityBuilder {
            def,
            input: None,
            output: None,
            action_factory: None,
        }
    }

    /// The current definition.
    #[must_use]
    pub fn def(&self) -> Arc<ActivityDef> {
        self.inner.def.load_full()
    }

    /// The input every motor draws segments from.
    #[must_use]
    pub fn input(&self) -> &Arc<dyn Input> {
        &self.inner.input
    }

    /// The output every motor forwards results to, if any.
    #[must_use]
    pub fn output(&self) -> Option<&Arc<dyn Output>> {
        self.inner.output.as_ref()
    }

    /// The limiter every motor passes through once per stride, if a stride rate is configured.
    #[must_use]
    pub fn stride_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.inner.stride_limiter.load_full()
    }

    /// The limiter every motor passes through once per cycle, if a cycle rate is configured.
    #[must_use]
    pub fn cycle_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.inner.cycle_limiter.load_full()
    }

    /// Timers and counters shared by the motors of this activity.
    #[must_use]
    pub fn instrumentation(&self) -> &ActivityInstrumentation {
        &self.inner.instrumentation
    }

    /// The run states of all motors of this activity.
    #[must_use]
    pub fn tally(&self) -> &Arc<RunStateTally> {
        &self.inner.tally
    }

    /// Creates a motor for `slot` with an action from the activity's action factory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the activity has no action factory or the
    /// action does not fit the `async` parameter.
    pub fn new_motor(&self, slot: usize) -> Result<Motor> {
        let factory = self.inner.action_factory.as_ref().ok_or_else(|| {
            Error::invalid_configuration("the activity has no action to create motors with")
        })?;

        Motor::new(self, slot, factory(slot))
    }

    /// Replaces the definition and broadcasts the change.
    ///
    /// # Errors
    ///
    /// Returns a parameter error if the new definition is invalid, in which case the current
    /// definition stays in effect.
    pub fn update_def(&self, def: ActivityDef) -> Result<()> {
        def.validate()?;

        let _serialized = self.inner.update_lock.lock();

        let previous = self.inner.def.swap(Arc::new(def));
        let def = self.def();

        if *previous == *def {
            debug!(alias = def.alias(), "activity definition unchanged");
            return Ok(());
        }

        self.inner.refresh_limiters(&def)?;

        self.inner.input.on_activity_def_update(&def);
        if let Some(output) = &self.inner.output {
            output.on_activity_def_update(&def);
        }

        let observers: Vec<_> = {
            let mut observers = self.inner.observers.lock();
            observers.retain(|observer| observer.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };

        for observer in observers {
            observer.on_activity_def_update(&def);
        }

        info!(alias = def.alias(), def = %def, "activity definition updated");

        Ok(())
    }

    /// Sets one parameter of the definition; see [`update_def()`][Self::update_def].
    ///
    /// # Errors
    ///
    /// Returns a parameter error if the resulting definition is invalid.
    pub fn set_param(&self, key: impl Into<String>, value: impl ToString) -> Result<()> {
        let mut def = ActivityDef::clone(&self.def());
        def.set(key, value);
        self.update_def(def)
    }

    /// Registers an observer for definition changes.
    ///
    /// The activity holds the observer weakly; it stops receiving updates once all other
    /// references to it are dropped.
    pub fn add_observer(&self, observer: &Arc<dyn ActivityDefObserver>) {
        self.register_observer(Arc::downgrade(observer));
    }

    pub(crate) fn register_observer(&self, observer: Weak<dyn ActivityDefObserver>) {
        self.inner.observers.lock().push(observer);
    }

    /// Asks every motor of the activity to stop at its next stride boundary, including motors
    /// that are still starting or not yet created.
    pub(crate) fn request_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }
}

impl ActivityInner {
    fn refresh_limiters(&self, def: &ActivityDef) -> Result<()> {
        refresh_limiter(&self.stride_limiter, def, "strides", def.stride_rate()?);
        refresh_limiter(&self.cycle_limiter, def, "cycles", def.cycle_rate()?);
        Ok(())
    }
}

fn refresh_limiter(
    slot: &ArcSwapOption<RateLimiter>,
    def: &ActivityDef,
    kind: &str,
    spec: Option<RateSpec>,
) {
    match (slot.load_full(), spec) {
        (Some(limiter), Some(spec)) => limiter.apply_rate_spec(spec),
        (None, Some(spec)) => {
            info!(alias = def.alias(), kind, %spec, "creating rate limiter");
            let label = format!("{}.{kind}", def.alias());
            slot.store(Some(Arc::new(RateLimiter::new(label, spec))));
        }
        (Some(_), None) => {
            info!(alias = def.alias(), kind, "removing rate limiter");
            slot.store(None);
        }
        (None, None) => {}
    }
}

impl fmt::Debug for Activity {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("def", &self.def())
            .field("stride_limiter", &self.stride_limiter())
            .field("cycle_limiter", &self.cycle_limiter())
            .field("tally", &self.inner.tally.image())
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Activity`].
///
/// Only the definition is required. Without an explicit input the activity uses an
/// [`AtomicInput`] over the `cycles` and `recycles` parameters. Without an output, results are
/// discarded. Without an action factory, motors must be created with [`Motor::new()`].
#[must_use]
pub struct ActivityBuilder {
    def: ActivityDef,
    input: Option<Arc<dyn Input>>,
    output: Option<Arc<dyn Output>>,
    action_factory: Option<Box<ActionFactory>>,
}

impl ActivityBuilder {
    /// Uses `input` as the source of cycles.
    pub fn input(self, input: impl Input + 'static) -> Self {
        self.shared_input(Arc::new(input))
    }

    /// Uses an input that is shared with other code, e.g. for inspecting its progress.
    pub fn shared_input(mut self, input: Arc<dyn Input>) -> Self {
        self.input = Some(input);
        self
    }

    /// Forwards results to `output`.
    pub fn output(self, output: impl Output + 'static) -> Self {
        self.shared_output(Arc::new(output))
    }

    /// Forwards results to an output that is shared with other code.
    pub fn shared_output(mut self, output: Arc<dyn Output>) -> Self {
        self.output = Some(output);
        self
    }

    /// Creates the action of each motor by calling `factory` with the motor's slot.
    pub fn action(
        mut self,
        factory: impl Fn(usize) -> MotorAction + Send + Sync + 'static,
    ) -> Self {
        self.action_factory = Some(Box::new(factory));
        self
    }

    /// Builds the activity.
    ///
    /// # Errors
    ///
    /// Returns a parameter error if the definition is invalid.
    pub fn build(self) -> Result<Activity> {
        self.def.validate()?;

        let input = match self.input {
            Some(input) => input,
            None => Arc::new(AtomicInput::from_def(&self.def)?),
        };

        let inner = ActivityInner {
            def: ArcSwap::from_pointee(self.def),
            input,
            output: self.output,
            action_factory: self.action_factory,
            stride_limiter: ArcSwapOption::empty(),
            cycle_limiter: ArcSwapOption::empty(),
            instrumentation: ActivityInstrumentation::default(),
            tally: Arc::new(RunStateTally::new()),
            observers: Mutex::new(Vec::new()),
            stop_requested: AtomicBool::new(false),
            update_lock: Mutex::new(()),
        };

        inner.refresh_limiters(&inner.def.load_full())?;

        let activity = Activity {
            inner: Arc::new(inner),
        };

        debug!(activity = ?activity, "activity built");

        Ok(activity)
    }
}

impl fmt::Debug for ActivityBuilder {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityBuilder")
            .field("def", &self.def)
            .field("has_input", &self.input.is_some())
            .field("has_output", &self.output.is_some())
            .field("has_action", &self.action_factory.is_some())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{BoxError, CycleSegment, RateVerb};

    assert_impl_all!(Activity: Send, Sync, Clone);

    #[derive(Debug, Default)]
    struct CountingObserver {
        updates: AtomicUsize,
    }

    impl ActivityDefObserver for CountingObserver {
        fn on_activity_def_update(&self, _def: &ActivityDef) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn def(text: &str) -> ActivityDef {
        text.parse().unwrap()
    }

    #[test]
    fn builds_default_input_from_def() {
        let activity = Activity::builder(def("cycles=5..8")).build().unwrap();

        let segment = activity.input().get_input_segment(nz!(10)).unwrap();
        assert_eq!(segment, CycleSegment::new(5..8));
        assert!(activity.output().is_none());
        assert!(activity.cycle_limiter().is_none());
    }

    #[test]
    fn rejects_invalid_def() {
        assert!(matches!(
            Activity::builder(def("threads=2")).build(),
            Err(Error::MissingParameter { .. })
        ));
        assert!(Activity::builder(def("cycles=5;threads=zero")).build().is_err());
    }

    #[test]
    fn rate_limiters_follow_def() {
        let activity = Activity::builder(def("cycles=5;cyclerate=100"))
            .build()
            .unwrap();

        let limiter = activity.cycle_limiter().unwrap();
        assert!((limiter.spec().ops_per_sec() - 100.0).abs() < f64::EPSILON);
        assert!(activity.stride_limiter().is_none());

        activity.set_param("cyclerate", "200").unwrap();
        let same = activity.cycle_limiter().unwrap();
        assert!(Arc::ptr_eq(&limiter, &same));
        assert!((same.spec().ops_per_sec() - 200.0).abs() < f64::EPSILON);
        assert_eq!(same.spec().verb(), RateVerb::Start);

        activity.set_param("striderate", "10").unwrap();
        assert_eq!(activity.stride_limiter().unwrap().label(), "unnamed.strides");

        let mut without = ActivityDef::clone(&activity.def());
        without.remove("cyclerate");
        activity.update_def(without).unwrap();
        assert!(activity.cycle_limiter().is_none());
    }

    #[test]
    fn invalid_update_keeps_current_def() {
        let activity = Activity::builder(def("cycles=5")).build().unwrap();

        assert!(activity.set_param("stride", "-1").is_err());
        assert_eq!(activity.def().get("stride"), None);
    }

    #[test]
    fn observers_see_changes_until_dropped() {
        let activity = Activity::builder(def("cycles=5")).build().unwrap();

        let counting = Arc::new(CountingObserver::default());
        let observer: Arc<dyn ActivityDefObserver> = counting.clone();
        activity.add_observer(&observer);

        activity.set_param("threads", 2).unwrap();
        // Unchanged definitions are not broadcast.
        activity.set_param("threads", 2).unwrap();
        assert_eq!(counting.updates.load(Ordering::Relaxed), 1);

        drop(observer);
        drop(counting);
        activity.set_param("threads", 3).unwrap();
        assert!(activity.inner.observers.lock().is_empty());
    }

    #[test]
    fn motors_come_from_factory() {
        let with_factory = Activity::builder(def("cycles=5"))
            .action(|_slot| {
                MotorAction::sync(|_cycle: u64| -> std::result::Result<i32, BoxError> { Ok(0) })
            })
            .build()
            .unwrap();
        let without_factory = Activity::builder(def("cycles=5")).build().unwrap();

        assert_eq!(with_factory.new_motor(4).unwrap().slot(), 4);
        assert!(matches!(
            without_factory.new_motor(0),
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn stop_request_is_sticky() {
        let activity = Activity::builder(def("cycles=5")).build().unwrap();
        assert!(!activity.is_stop_requested());

        activity.clone().request_stop();

        assert!(activity.is_stop_requested());
    }
}
