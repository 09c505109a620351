use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strand_core::{Cx, Step, Task, Up};

/// Descends `remaining` levels, yields once at the bottom, and returns the depth
fn descend(cx: &mut Cx<'_>, remaining: u32) -> anyhow::Result<Step<u32>> {
    let remaining: u32 = match cx.restore()? {
        Some((_, saved)) => saved,
        None => remaining,
    };
    cx.down();
    let step = if remaining == 0 {
        cx.yield_now()?;
        Step::Ready(0)
    } else {
        descend(cx, remaining - 1)?
    };
    match cx.up()? {
        Up::Capture => {
            cx.capture(1, remaining)?;
            return Ok(Step::Unwind);
        }
        Up::Propagate => return Ok(Step::Unwind),
        Up::Normal | Up::Retired => {}
    }
    Ok(step.map(|depth| depth + 1))
}

fn nested_task(depth: u32) -> Task {
    Task::from_fn(move |cx| {
        descend(cx, depth)?;
        Ok(())
    })
}

fn bench_no_suspension(c: &mut Criterion) {
    c.bench_function("resume_to_completion", |b| {
        b.iter(|| {
            let mut task = Task::from_fn(|_| Ok(()));
            black_box(task.resume().unwrap())
        });
    });
}

fn bench_suspend_resume(c: &mut Criterion) {
    let mut group = c.benchmark_group("suspend_resume");

    for depth in [1u32, 10, 100] {
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut task = nested_task(black_box(depth));
                let suspended = task.resume().unwrap();
                let done = task.resume().unwrap();
                black_box((suspended, done))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_no_suspension, bench_suspend_resume);
criterion_main!(benches);
