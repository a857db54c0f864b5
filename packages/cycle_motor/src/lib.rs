#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Rate-limited, multithreaded execution of numbered units of work.
//!
//! An [`Activity`] describes a workload: a range of cycle numbers, an action that executes one
//! cycle, and how many threads, how large a batch and how high a rate to run it with. Each
//! thread runs a [`Motor`] that repeatedly reserves a contiguous segment of cycles from the
//! shared [`Input`], paces it through the configured [`RateLimiter`]s, executes it and hands the
//! per-cycle result codes to the [`Output`] as a [`CycleResultsSegment`].
//!
//! # Quick start
//!
//! ```rust
//! use cycle_motor::{Activity, BoxError, MotorAction};
//!
//! let activity = Activity::builder("cycles=1000;threads=4;stride=50".parse()?)
//!     .action(|_slot| {
//!         MotorAction::sync(|cycle: u64| -> Result<i32, BoxError> {
//!             // Execute the operation for `cycle` against the system under test.
//!             Ok(i32::from(cycle % 100 == 0))
//!         })
//!     })
//!     .build()?;
//!
//! let summary = activity.start()?.await_completion()?;
//!
//! assert_eq!(summary.finished, 4);
//! assert_eq!(activity.instrumentation().cycles_completed().get(), 1000);
//! # Ok::<(), cycle_motor::Error>(())
//! ```
//!
//! # Activity parameters
//!
//! | Parameter | Meaning | Default |
//! |-----------|---------|---------|
//! | `alias` | Name used in thread names and log messages | `unnamed` |
//! | `cycles` | `N` for `0..N`, or `A..B` | required |
//! | `recycles` | How many times to repeat the cycle range, as `N` or `A..B` | `0..1` |
//! | `threads` | Number of motors | `1` |
//! | `stride` | Cycles per segment | `1` |
//! | `cyclerate` | Cycle rate, as `rate[,burst ratio[,verb]]` | unlimited |
//! | `striderate` | Stride rate, same format | unlimited |
//! | `async` | Maximum asynchronous operations in flight per motor | synchronous |
//!
//! Counts accept unit suffixes such as `10K` or `1M`. Any parameter can change while the
//! activity runs; see [`ActivityExecution::update_def()`].
//!
//! # Failures
//!
//! Action and output failures are fatal: the failing motor enters [`RunState::Errored`], the
//! activity is stopped and [`ActivityExecution::await_completion()`] returns the failure. The
//! error raised by the component is preserved unchanged as the source, so it can be recovered
//! with [`Error::into_component_error()`] and downcast.
//!
//! Non-zero result codes are not failures; they are recorded and forwarded like any other
//! result.
//!
//! # Observability
//!
//! Activity-scoped timers and counters are available from [`Activity::instrumentation()`].
//! Process-wide service time histograms are published through the `nm` crate. Log messages are
//! emitted through `tracing`.

mod action;
mod activity;
mod activity_def;
mod cycle_log;
mod cycles;
mod error;
mod executor;
mod input;
mod instrumentation;
mod metrics;
mod motor;
mod output;
mod rate_limiter;
mod rate_spec;
mod result;
mod results_segment;
mod run_state;
mod segment_buffer;
mod tracker;
mod units;

pub use action::*;
pub use activity::*;
pub use activity_def::*;
pub use cycle_log::*;
pub use cycles::*;
pub use error::*;
pub use executor::*;
pub use input::*;
pub use instrumentation::*;
pub use motor::*;
pub use output::*;
pub use rate_limiter::*;
pub use rate_spec::*;
pub use result::*;
pub use results_segment::*;
pub use run_state::*;
pub use segment_buffer::*;
pub use tracker::TrackedOp;
