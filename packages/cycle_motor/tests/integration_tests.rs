//! Integration tests for activities executed on real motor threads.
//!
//! They are ignored under Miri because they depend on wall-clock pacing and many threads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use cycle_motor::{
    Activity, ActivityDef, AsyncAction, BoxError, ContiguousChunker, CycleLogOutput,
    CycleLogReader, CycleResult, CycleResultsSegment, Error, MotorAction, Output, RunState,
    SKIPPED, TrackedOp,
};
use parking_lot::Mutex;
use testing::{init_test_logging, wait_until, with_watchdog, within_tolerance};

#[derive(Debug, Default)]
struct Recorder {
    segments: Mutex<Vec<CycleResultsSegment>>,
}

impl Recorder {
    fn segments(&self) -> Vec<CycleResultsSegment> {
        self.segments.lock().clone()
    }

    /// Every forwarded result, keyed by cycle. Panics on a duplicate.
    fn results_by_cycle(&self) -> BTreeMap<u64, i8> {
        let mut results = BTreeMap::new();

        for result in self.segments.lock().iter().flatten() {
            let previous = results.insert(result.cycle(), result.result());
            assert!(previous.is_none(), "cycle {} forwarded twice", result.cycle());
        }

        results
    }
}

impl Output for Recorder {
    fn on_cycle_result_segment(&self, segment: &CycleResultsSegment) -> Result<(), BoxError> {
        self.segments.lock().push(segment.clone());
        Ok(())
    }
}

fn sync_action(
    action: impl Fn(u64) -> Result<i32, BoxError> + Clone + Send + Sync + 'static,
) -> impl Fn(usize) -> MotorAction + Send + Sync + 'static {
    move |_slot| MotorAction::sync(action.clone())
}

#[cfg_attr(miri, ignore)]
#[test]
fn two_threads_share_ten_cycles_in_strides_of_five() {
    with_watchdog(|| {
        init_test_logging();

        let recorder = Arc::new(Recorder::default());
        let activity = Activity::builder("cycles=10;threads=2;stride=5".parse().unwrap())
            .shared_output(recorder.clone())
            .action(sync_action(|_| Ok(0)))
            .build()
            .unwrap();

        let summary = activity.start().unwrap().await_completion().unwrap();

        assert_eq!(summary.finished, 2);

        let segments = recorder.segments();
        assert_eq!(segments.len(), 2);

        let mut starts: Vec<_> = segments
            .iter()
            .map(|segment| {
                assert_eq!(segment.len(), 5);
                segment.min_cycle().unwrap()
            })
            .collect();
        starts.sort_unstable();
        assert_eq!(starts, vec![0, 5]);

        let results = recorder.results_by_cycle();
        assert_eq!(results.keys().copied().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn every_cycle_executes_exactly_once() {
    with_watchdog(|| {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder::default());

        let activity = Activity::builder("cycles=10K;threads=8;stride=37".parse().unwrap())
            .shared_output(recorder.clone())
            .action({
                let executed = Arc::clone(&executed);
                sync_action(move |cycle| {
                    executed.lock().push(cycle);
                    Ok(i32::try_from(cycle % 7).unwrap())
                })
            })
            .build()
            .unwrap();

        activity.start().unwrap().await_completion().unwrap();

        let mut executed = executed.lock().clone();
        executed.sort_unstable();
        assert_eq!(executed, (0..10_000).collect::<Vec<_>>());

        let results = recorder.results_by_cycle();
        assert_eq!(results.len(), 10_000);
        assert!(
            results
                .iter()
                .all(|(cycle, result)| i64::from(*result) == i64::try_from(cycle % 7).unwrap())
        );

        // 10000 = 270 * 37 + 10
        let mut sizes: Vec<_> = recorder.segments().iter().map(CycleResultsSegment::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes.first(), Some(&10));
        assert_eq!(sizes.len(), 271);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn recycles_repeat_the_cycle_range() {
    with_watchdog(|| {
        let executed = Arc::new(Mutex::new(Vec::new()));

        let activity = Activity::builder("cycles=4;recycles=3;threads=2;stride=3".parse().unwrap())
            .action({
                let executed = Arc::clone(&executed);
                sync_action(move |cycle| {
                    executed.lock().push(cycle);
                    Ok(0)
                })
            })
            .build()
            .unwrap();

        activity.start().unwrap().await_completion().unwrap();

        let mut executed = executed.lock().clone();
        executed.sort_unstable();
        assert_eq!(executed, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn chunker_forwards_every_recycle() {
    with_watchdog(|| {
        let recorder = Arc::new(Recorder::default());
        let downstream: Arc<dyn Output> = recorder.clone();
        let chunker = Arc::new(ContiguousChunker::new(0, vec![downstream]));

        let activity =
            Activity::builder("cycles=10;recycles=2;threads=2;stride=5".parse().unwrap())
                .shared_output(chunker.clone())
                .action(sync_action(|_| Ok(0)))
                .build()
                .unwrap();

        let summary = activity.start().unwrap().await_completion().unwrap();
        assert_eq!(summary.finished, 2);

        let forwarded: usize = recorder.segments().iter().map(CycleResultsSegment::len).sum();
        assert_eq!(forwarded, 20);
        assert_eq!(activity.instrumentation().cycles_completed().get(), 20);

        assert_eq!(chunker.next_cycle(0), 10);
        assert_eq!(chunker.next_cycle(1), 10);
        assert_eq!(chunker.pending_results(), 0);
    });
}

#[derive(Debug, thiserror::Error)]
#[error("operation {id} failed")]
struct Unique {
    id: u128,
}

#[cfg_attr(miri, ignore)]
#[test]
fn action_error_reaches_caller_unchanged() {
    with_watchdog(|| {
        let id = 0x5eed_cafe_u128;

        let activity = Activity::builder("cycles=1M;threads=4;stride=10".parse().unwrap())
            .action(sync_action(move |cycle| {
                if cycle == 777 {
                    return Err(Box::new(Unique { id }));
                }
                Ok(0)
            }))
            .build()
            .unwrap();

        let error = activity.start().unwrap().await_completion().unwrap_err();

        assert!(matches!(error, Error::Action { cycle: 777, .. }));

        let source = error.into_component_error().unwrap();
        let unique = source.downcast::<Unique>().unwrap();
        assert_eq!(unique.id, id);

        let image = activity.tally().image();
        assert_eq!(image.count(RunState::Errored), 1);
        assert_eq!(image.count(RunState::Running), 0);
        assert_eq!(image.total(), 4);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn failure_cuts_short_the_strides_of_other_motors() {
    with_watchdog(|| {
        let executed = Arc::new(Mutex::new(0_u64));

        let activity = Activity::builder("cycles=2000;threads=2;stride=1000".parse().unwrap())
            .action({
                let executed = Arc::clone(&executed);
                sync_action(move |cycle| {
                    if cycle == 0 {
                        return Err("first cycle rejected".into());
                    }

                    *executed.lock() += 1;
                    thread::sleep(Duration::from_millis(2));
                    Ok(0)
                })
            })
            .build()
            .unwrap();

        let started = Instant::now();
        let error = activity.start().unwrap().await_completion().unwrap_err();

        assert!(matches!(error, Error::Action { cycle: 0, .. }));

        // Running the other stride to its end would take two seconds.
        let executed = *executed.lock();
        assert!(executed < 500, "executed {executed}");
        assert!(started.elapsed() < Duration::from_secs(2));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn stop_ends_every_motor_and_skips_abandoned_cycles() {
    with_watchdog(|| {
        let recorder = Arc::new(Recorder::default());
        let activity = Activity::builder("cycles=1T;threads=3;stride=100".parse().unwrap())
            .shared_output(recorder.clone())
            .action(sync_action(|_| {
                thread::sleep(Duration::from_micros(50));
                Ok(0)
            }))
            .build()
            .unwrap();

        let execution = activity.start().unwrap();

        let image = activity
            .tally()
            .await_none_other(Duration::from_secs(10), &[RunState::Running]);
        assert!(!image.is_timeout(), "motors did not start: {image}");

        execution.request_stop();
        // Stopping twice is harmless.
        execution.request_stop();

        let summary = execution.await_completion().unwrap();
        assert_eq!(summary.stopped, 3);

        let results = recorder.results_by_cycle();
        let skipped = results.values().filter(|result| **result == SKIPPED).count();

        assert_eq!(
            u64::try_from(skipped).unwrap(),
            activity.instrumentation().cycles_skipped().get()
        );
        assert_eq!(
            u64::try_from(results.len() - skipped).unwrap(),
            activity.instrumentation().cycles_completed().get()
        );
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cycle_rate_bounds_throughput() {
    with_watchdog(|| {
        let activity = Activity::builder("cycles=300;threads=4;cyclerate=1000".parse().unwrap())
            .action(sync_action(|_| Ok(0)))
            .build()
            .unwrap();

        let started = Instant::now();
        activity.start().unwrap().await_completion().unwrap();
        let elapsed = started.elapsed();

        // The limiter admits a small burst, so the lower bound is slightly under 300 ms.
        assert!(elapsed >= Duration::from_millis(250), "finished too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "finished too slow: {elapsed:?}");

        let limiter = activity.cycle_limiter().unwrap();
        assert!(limiter.blocks() >= 300);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn stride_rate_converges_to_target() {
    with_watchdog(|| {
        let activity =
            Activity::builder("cycles=500;threads=3;stride=5;striderate=200".parse().unwrap())
                .action(sync_action(|_| Ok(0)))
                .build()
                .unwrap();

        let summary = activity.start().unwrap().await_completion().unwrap();

        let strides = activity.instrumentation().strides_service().count();
        assert_eq!(strides, 100);

        #[expect(
            clippy::cast_precision_loss,
            reason = "stride counts in tests are far below the precision limit"
        )]
        let measured = strides as f64 / summary.elapsed.as_secs_f64();

        assert!(
            within_tolerance(measured, 200.0, 0.5),
            "measured {measured} strides/s"
        );
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn stride_delay_accounts_for_falling_behind() {
    with_watchdog(|| {
        const STRIDES: u32 = 20;
        const STRIDE_WORK: Duration = Duration::from_millis(20);
        // 100 strides/s, half the pace the action can keep up with.
        const SCHEDULED_INTERVAL: Duration = Duration::from_millis(10);

        let started = Instant::now();

        let activity =
            Activity::builder("cycles=20;threads=1;stride=1;striderate=100".parse().unwrap())
                .action(sync_action(|_| {
                    thread::sleep(STRIDE_WORK);
                    Ok(0)
                }))
                .build()
                .unwrap();

        activity.start().unwrap().await_completion().unwrap();
        let wall = started.elapsed();

        let instrumentation = activity.instrumentation();
        let service = instrumentation.strides_service();
        let delay = instrumentation.strides_delay();

        assert_eq!(service.count(), u64::from(STRIDES));
        assert_eq!(delay.count(), u64::from(STRIDES));

        // Every stride is charged its own execution time plus the delay the limiter reported.
        assert!(
            service.total() >= delay.total() + STRIDE_WORK * STRIDES,
            "service {:?}, delay {:?}",
            service.total(),
            delay.total()
        );

        // The last stride is admitted after 19 slow strides, while the schedule only allots
        // 19 intervals. The difference shows up as delay, less what the limiter's burst
        // allowance absorbs, and never exceeds how late the run actually is.
        let last_delay = delay.max();
        let schedule = SCHEDULED_INTERVAL * (STRIDES - 1);

        assert!(last_delay >= Duration::from_millis(100), "delay {last_delay:?}");
        assert!(
            last_delay <= wall.saturating_sub(schedule),
            "delay {last_delay:?}, wall {wall:?}"
        );

        assert_eq!(instrumentation.cycles_delay().count(), 0);
        assert_eq!(activity.stride_limiter().unwrap().blocks(), u64::from(STRIDES) + 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn rate_change_releases_blocked_motors() {
    with_watchdog(|| {
        let activity = Activity::builder("cycles=40;threads=2;cyclerate=2".parse().unwrap())
            .action(sync_action(|_| Ok(0)))
            .build()
            .unwrap();

        let started = Instant::now();
        let execution = activity.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            activity.instrumentation().cycles_completed().get() >= 1
        }));

        // At 2 ops/s this activity would take 20 seconds.
        execution.set_param("cyclerate", "100000").unwrap();
        execution.await_completion().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(activity.instrumentation().cycles_completed().get(), 40);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn threads_can_be_added_while_running() {
    with_watchdog(|| {
        let activity = Activity::builder("cycles=1T;threads=1".parse().unwrap())
            .action(sync_action(|_| {
                thread::sleep(Duration::from_micros(200));
                Ok(0)
            }))
            .build()
            .unwrap();

        let execution = activity.start().unwrap();

        let mut def = ActivityDef::clone(&activity.def());
        def.set("threads", 4);
        execution.update_def(def).unwrap();

        let image = activity
            .tally()
            .await_any(Duration::from_secs(10), &[RunState::Running]);
        assert!(!image.is_timeout());
        assert!(wait_until(Duration::from_secs(10), || {
            activity.tally().tally(RunState::Running) == 4
        }));

        execution.request_stop();
        let summary = execution.await_completion().unwrap();

        assert_eq!(summary.stopped, 4);
        assert_eq!(activity.tally().image().total(), 4);
    });
}

/// Completes operations on a pool of worker threads fed through a channel.
struct ChannelAction {
    ops: mpsc::Sender<TrackedOp>,
}

impl ChannelAction {
    fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<TrackedOp>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            thread::spawn(move || {
                loop {
                    let next = rx.lock().recv();
                    let Ok(op) = next else {
                        break;
                    };

                    if op.cycle() % 100 == 99 {
                        op.fail("simulated timeout".into());
                    } else {
                        op.succeed(1);
                    }
                }
            });
        }

        Self { ops: tx }
    }
}

impl AsyncAction for ChannelAction {
    fn enqueue(&mut self, op: TrackedOp) -> Result<(), BoxError> {
        self.ops.send(op).map_err(|e| Box::new(e) as BoxError)
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn async_operations_complete_out_of_band() {
    with_watchdog(|| {
        let recorder = Arc::new(Recorder::default());
        let downstream: Arc<dyn Output> = recorder.clone();
        let chunker = Arc::new(ContiguousChunker::new(0, vec![downstream]));

        let activity = Activity::builder("cycles=1000;threads=2;stride=10;async=8".parse().unwrap())
            .shared_output(chunker.clone())
            .action(|_slot| MotorAction::asynchronous(ChannelAction::new(3)))
            .build()
            .unwrap();

        activity.start().unwrap().await_completion().unwrap();

        // The chunker reassembles the out-of-order strides into one contiguous run.
        assert_eq!(chunker.next_cycle(0), 1000);
        assert_eq!(chunker.pending_results(), 0);

        let results = recorder.results_by_cycle();
        assert_eq!(results.len(), 1000);
        assert_eq!(
            results.values().filter(|result| **result == cycle_motor::FAILED).count(),
            10
        );
        assert_eq!(activity.instrumentation().cycles_failed().get(), 10);
        assert_eq!(activity.instrumentation().strides_service().count(), 100);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cycle_log_captures_every_result() {
    with_watchdog(|| {
        let path = std::env::temp_dir().join(format!(
            "cycle_motor_{}_{:?}.cyclelog",
            std::process::id(),
            thread::current().id()
        ));

        let activity = Activity::builder("cycles=500;threads=3;stride=16".parse().unwrap())
            .output(CycleLogOutput::create(&path).unwrap())
            .action(sync_action(|cycle| Ok(i32::from(cycle % 2 == 0))))
            .build()
            .unwrap();

        activity.start().unwrap().await_completion().unwrap();

        let mut results = CycleLogReader::open(&path).unwrap().read_all().unwrap();
        std::fs::remove_file(&path).unwrap();

        results.sort();
        assert_eq!(
            results,
            (0..500)
                .map(|cycle| CycleResult::new(cycle, i8::from(cycle % 2 == 0)))
                .collect::<Vec<_>>()
        );
    });
}
