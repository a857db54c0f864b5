#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples of the cycle motor packages.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How long a test may run before [`with_watchdog()`] aborts it.
///
/// Miri is dramatically slower for thread synchronization, so it gets a longer timeout to avoid
/// false positives while still catching real hangs.
pub const WATCHDOG_TIMEOUT: Duration = if cfg!(miri) {
    Duration::from_secs(120)
} else {
    Duration::from_secs(30)
};

/// Runs a test on a separate thread and fails it if it does not complete within
/// [`WATCHDOG_TIMEOUT`].
///
/// Motor tests coordinate many threads through condition variables and rate limiters, so a bug
/// tends to show up as a hang rather than a failure. The watchdog turns such hangs into test
/// failures instead of stalling the whole run.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test runs directly, so that mutation testing can detect hanging mutations by its own
/// timeout.
///
/// # Panics
///
/// Panics if the test times out. Panics from the test itself are propagated unchanged.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 2 + 2);
/// assert_eq!(answer, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::Builder::new()
        .name("watched-test".to_string())
        .spawn(move || {
            // If sending fails, the watchdog already gave up on us.
            drop(tx.send(test_fn()));
        })
        .expect("spawning the test thread should succeed");

    match rx.recv_timeout(WATCHDOG_TIMEOUT) {
        Ok(result) => {
            test_thread
                .join()
                .expect("test thread completed, so it cannot have panicked");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the watchdog timeout of {WATCHDOG_TIMEOUT:?}");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread ended without a result"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was observed to hold.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    let deadline = Instant::now().checked_add(timeout);

    loop {
        if condition() {
            return true;
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Whether `actual` is within `tolerance` (a fraction, e.g. 0.1 for 10%) of `expected`.
///
/// Used for assertions on measured rates and durations, which are never exact.
#[must_use]
pub fn within_tolerance(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= expected.abs() * tolerance
}

/// Installs a `tracing` subscriber that writes through the test harness's captured output.
///
/// Safe to call from every test; only the first call in a process has an effect.
pub fn init_test_logging() {
    // Another test may have installed the subscriber first; that is fine.
    drop(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init(),
    );
}
