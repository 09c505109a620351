//! A task that pauses seven times on latches carrying 6 down to 0.
//!
//! The driver releases each latch and resumes the task until it finds the
//! latch carrying 0, then leaves the task suspended.
//!
//! Run with `RUST_LOG=strand_core=trace` to see the task lifecycle.

use strand_core::{Latch, Task, Up};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("main starts");
    let mut task = Task::from_fn(|cx| {
        let mut i: i32 = match cx.restore()? {
            Some((_, i)) => i,
            None => {
                println!("execute-1");
                6
            }
        };
        while i >= 0 {
            cx.down();
            cx.pause(Latch::new(i).reason())?;
            match cx.up()? {
                Up::Capture => return Ok(cx.capture(1, i)?),
                Up::Propagate => return Ok(()),
                Up::Normal | Up::Retired => {}
            }
            println!("execute-2.{}", i);
            i -= 1;
        }
        Ok(())
    });

    task.resume()?;
    println!("task started");
    while let Some(reason) = task.pause_reason().cloned() {
        if !reason.is_valid(&task) {
            break;
        }
        let Some(latch) = reason.downcast_ref::<Latch<i32>>() else {
            break;
        };
        if *latch.payload() == 0 {
            break;
        }
        println!("found pause reason: {}", reason);
        latch.release();
        task.resume()?;
    }
    println!("main ends: {}", task);
    Ok(())
}
