use std::hint::black_box;
use std::time::Duration;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use otter_bdd::{Env, EnvConfig};

fn quiet_env() -> Env {
    Env::new(EnvConfig {
        update_interval_ms: 0,
        ..EnvConfig::default()
    })
}

fn sync_blocks_env(blocks: usize) -> Env {
    let env = quiet_env();
    env.describe("bench", move |env| {
        env.it("sync blocks", move |ctx| {
            for _ in 0..blocks {
                ctx.runs(|ctx| {
                    ctx.check(true, "ok");
                    Ok(())
                });
            }
            Ok(())
        })?;
        Ok(())
    });
    env
}

fn wide_suite_env(specs: usize) -> Env {
    let env = quiet_env();
    env.describe("bench", move |env| {
        env.before_each(|_| Ok(()));
        env.after_each(|_| Ok(()));
        for i in 0..specs {
            env.it(&format!("spec {i}"), |ctx| {
                ctx.check(true, "ok");
                Ok(())
            })?;
        }
        Ok(())
    });
    env
}

fn bench_queue_drive(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drive");

    group.bench_function("10k_sync_blocks_one_spec", |b| {
        b.iter_batched(
            || sync_blocks_env(10_000),
            |env| {
                env.execute();
                black_box(env.results().total_count);
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("2k_specs_with_hooks", |b| {
        b.iter_batched(
            || wide_suite_env(2_000),
            |env| {
                env.execute();
                black_box(env.results().total_count);
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("fake_clock_1k_waits", |b| {
        b.iter_batched(
            || {
                let env = quiet_env();
                env.describe("bench", |env| {
                    env.it("waits", |ctx| {
                        ctx.use_fake_clock();
                        for _ in 0..1_000 {
                            ctx.waits(Duration::from_millis(1));
                        }
                        Ok(())
                    })?;
                    Ok(())
                });
                env
            },
            |env| {
                env.execute();
                env.clock()
                    .tick(Duration::from_millis(1_000))
                    .expect("fake clock installed by the spec");
                black_box(env.is_finished());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_queue_drive);
criterion_main!(benches);
