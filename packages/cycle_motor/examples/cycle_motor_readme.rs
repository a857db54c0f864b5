//! Example from the README.
//!
//! Runs a rate-limited activity on four threads, raises its rate while it runs and prints the
//! collected metrics at the end.

use std::thread;
use std::time::Duration;

use cycle_motor::{Activity, ActivityDef, BoxError, MotorAction};

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let def: ActivityDef = "alias=demo;cycles=2000;threads=4;stride=20;cyclerate=1000".parse()?;

    let activity = Activity::builder(def)
        .action(|_slot| {
            MotorAction::sync(|cycle: u64| -> Result<i32, BoxError> {
                // Pretend that every 50th operation returns a non-success status.
                Ok(i32::from(cycle % 50 == 0))
            })
        })
        .build()?;

    let execution = activity.start()?;

    thread::sleep(Duration::from_millis(500));
    execution.set_param("cyclerate", "5000")?;

    let summary = execution.await_completion()?;

    let instrumentation = activity.instrumentation();
    println!("{} motors finished in {:?}", summary.finished, summary.elapsed);
    println!(
        "{} cycles completed, mean service time {:?}",
        instrumentation.cycles_completed().get(),
        instrumentation.cycles_service().mean()
    );

    println!("{}", nm::Report::collect());

    Ok(())
}
