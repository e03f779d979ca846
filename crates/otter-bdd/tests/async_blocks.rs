//! Blocks completing through `Done`, timeouts and uncaught errors

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use common::{entries, env, env_with, log};
use otter_bdd::{Done, EnvConfig, Error, Failure, FailureKind, SpecId};

#[test]
fn test_done_called_later_advances_queue() {
    let env = env();
    let order = log();
    let pending: Rc<RefCell<Option<Done>>> = Rc::new(RefCell::new(None));

    let (o, slot) = (order.clone(), pending.clone());
    env.describe("async", move |env| {
        let body_log = o.clone();
        let slot = slot.clone();
        env.it_async(
            "waits for done",
            move |_, done| {
                body_log.borrow_mut().push("started".into());
                *slot.borrow_mut() = Some(done);
                Ok(())
            },
            None,
        )?;
        let after = o.clone();
        env.it("next", move |_| {
            after.borrow_mut().push("next spec".into());
            Ok(())
        })?;
        Ok(())
    });

    env.execute();
    assert_eq!(entries(&order), vec!["started"]);
    assert!(!env.is_finished());

    let done = pending.borrow_mut().take().unwrap();
    done.complete();
    assert_eq!(entries(&order), vec!["started", "next spec"]);
    assert!(env.is_finished());
    assert!(done.is_complete());
}

#[test]
fn test_done_is_idempotent() {
    let env = env();
    let after_runs = Rc::new(Cell::new(0));

    let counter = after_runs.clone();
    env.describe("async", move |env| {
        env.it_async(
            "double done",
            |_, done| {
                done.complete();
                done.complete();
                Ok(())
            },
            None,
        )?;
        let counter = counter.clone();
        env.it("counted", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        })?;
        Ok(())
    });

    env.run().unwrap();
    assert_eq!(after_runs.get(), 1);
}

#[test]
fn test_async_timeout_advances_without_failure_by_default() {
    let env = env();
    let mut spec = SpecId(usize::MAX);
    env.describe("async", |env| {
        spec = env.it_async("forgets done", |_, _done| Ok(()), Some(Duration::from_millis(40)))?;
        Ok(())
    });

    let started = std::time::Instant::now();
    env.run().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(40));
    let results = env.spec_results(spec).unwrap();
    assert_eq!(results.total_count, 0);
}

#[test]
fn test_async_timeout_can_fail_the_spec() {
    let env = env_with(EnvConfig {
        update_interval_ms: 0,
        fail_on_async_timeout: true,
        ..EnvConfig::default()
    });
    let mut spec = SpecId(usize::MAX);
    env.describe("async", |env| {
        spec = env.it("uses fake time", |ctx| {
            ctx.use_fake_clock();
            ctx.runs_async(|_, _done| Ok(()), Some(Duration::from_millis(25)));
            Ok(())
        })?;
        Ok(())
    });

    env.execute();
    env.clock().tick(Duration::from_millis(25)).unwrap();
    assert!(env.is_finished());

    let results = env.spec_results(spec).unwrap();
    let failure = results.failures().next().unwrap();
    assert_eq!(failure.kind, Some(FailureKind::Timeout));
    assert!(failure.message.contains("timed out after 25 msec"));
}

#[test]
fn test_done_after_timeout_is_ignored() {
    let env = env();
    let stash: Rc<RefCell<Option<Done>>> = Rc::new(RefCell::new(None));
    let next_runs = Rc::new(Cell::new(0));

    let (slot, counter) = (stash.clone(), next_runs.clone());
    env.describe("async", move |env| {
        let slot = slot.clone();
        env.it("late done", move |ctx| {
            ctx.use_fake_clock();
            let slot = slot.clone();
            ctx.runs_async(
                move |_, done| {
                    *slot.borrow_mut() = Some(done);
                    Ok(())
                },
                Some(Duration::from_millis(10)),
            );
            Ok(())
        })?;
        let counter = counter.clone();
        env.it("after", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        })?;
        Ok(())
    });

    env.execute();
    env.clock().tick(Duration::from_millis(10)).unwrap();
    assert_eq!(next_runs.get(), 1);
    assert!(env.is_finished());

    let late = stash.borrow_mut().take().unwrap();
    assert!(late.is_complete());
    late.complete();
    assert_eq!(next_runs.get(), 1);
}

#[test]
fn test_unbounded_timeout_on_real_clock() {
    let env = env();
    let mut spec = SpecId(usize::MAX);
    env.describe("async", |env| {
        spec = env.it_async(
            "no practical limit",
            |ctx, done| {
                ctx.check(true, "started");
                done.complete();
                Ok(())
            },
            Some(Duration::MAX),
        )?;
        Ok(())
    });

    let results = env.run().unwrap();
    assert_eq!(results.passed_count, 1);
    assert!(!env.host().has_pending_tasks());
    assert!(env.spec_results(spec).unwrap().passed());
}

#[test]
fn test_unbounded_timeout_on_fake_clock() {
    let env = env();
    let completed = Rc::new(Cell::new(false));

    let flag = completed.clone();
    env.describe("async", move |env| {
        let flag = flag.clone();
        env.it("after some virtual time", move |ctx| {
            ctx.use_fake_clock();
            ctx.waits(Duration::from_millis(10));
            let flag = flag.clone();
            ctx.runs_async(
                move |_, done| {
                    flag.set(true);
                    done.complete();
                    Ok(())
                },
                Some(Duration::MAX),
            );
            Ok(())
        })?;
        Ok(())
    });

    env.execute();
    env.clock().tick(Duration::from_millis(10)).unwrap();
    assert!(completed.get());
    assert!(env.is_finished());
    assert!(!env.clock().is_installed());
    assert_eq!(env.clock().fake_timer().pending(), 0);
}

#[test]
fn test_done_fail_records_failure() {
    let env = env();
    let mut spec = SpecId(usize::MAX);
    env.describe("async", |env| {
        spec = env.it_async(
            "fails",
            |_, done| {
                done.fail(Failure::assertion("remote said no"));
                Ok(())
            },
            None,
        )?;
        Ok(())
    });

    env.run().unwrap();
    let results = env.spec_results(spec).unwrap();
    assert_eq!(results.failed_count, 1);
    assert_eq!(
        results.failures().next().unwrap().kind,
        Some(FailureKind::Assertion)
    );
}

#[test]
fn test_async_body_error_completes_block() {
    let env = env();
    let mut spec = SpecId(usize::MAX);
    env.describe("async", |env| {
        spec = env.it_async("errors", |_, _done| Err(anyhow!("no connection")), None)?;
        Ok(())
    });

    let results = env.run().unwrap();
    assert!(env.is_finished());
    assert_eq!(results.failed_count, 1);
    assert!(
        env.spec_results(spec)
            .unwrap()
            .failures()
            .next()
            .unwrap()
            .message
            .contains("no connection")
    );
}

#[test]
fn test_uncaught_error_halts_run() {
    let env = env_with(EnvConfig {
        update_interval_ms: 0,
        catch_exceptions: false,
        ..EnvConfig::default()
    });
    let later = Rc::new(Cell::new(false));

    let flag = later.clone();
    env.describe("halts", move |env| {
        env.it("throws", |_| Err(anyhow!("unhandled")))?;
        let flag = flag.clone();
        env.it("never reached", move |_| {
            flag.set(true);
            Ok(())
        })?;
        Ok(())
    });

    let err = env.run().unwrap_err();
    assert!(matches!(err, Error::Uncaught(ref message) if message.contains("unhandled")));
    assert!(env.is_halted());
    assert!(!env.is_finished());
    assert!(!later.get());
}

#[test]
fn test_env_runs_again_after_halt() {
    let env = env_with(EnvConfig {
        update_interval_ms: 0,
        catch_exceptions: false,
        ..EnvConfig::default()
    });
    let first_attempt = Rc::new(Cell::new(true));
    let slot = Rc::new(RefCell::new("real"));
    let later_runs = Rc::new(Cell::new(0));

    let (attempt, spied, counter) = (first_attempt.clone(), slot.clone(), later_runs.clone());
    env.describe("flaky", move |env| {
        let (attempt, spied) = (attempt.clone(), spied.clone());
        env.it("fails once", move |ctx| {
            ctx.use_fake_clock();
            ctx.spy_on(&spied, "fake")?;
            if attempt.replace(false) {
                return Err(anyhow!("first attempt"));
            }
            ctx.check(true, "second attempt");
            Ok(())
        })?;
        let counter = counter.clone();
        env.it("afterwards", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        })?;
        Ok(())
    });

    assert!(matches!(env.run(), Err(Error::Uncaught(_))));
    assert_eq!(later_runs.get(), 0);

    let results = env.run().unwrap();
    assert!(!env.is_halted());
    assert!(env.is_finished());
    assert_eq!(results.passed_count, 1);
    assert_eq!(later_runs.get(), 1);
    assert_eq!(*slot.borrow(), "real");
    assert!(!env.clock().is_installed());
}

#[tokio::test]
async fn test_run_async_drives_real_timers() {
    let env = env();
    let order = log();

    let o = order.clone();
    env.describe("tokio", move |env| {
        let o = o.clone();
        env.it("sleeps", move |ctx| {
            ctx.waits(Duration::from_millis(5));
            let o = o.clone();
            ctx.runs(move |ctx| {
                o.borrow_mut().push("awake".into());
                ctx.check(true, "woke up");
                Ok(())
            });
            Ok(())
        })?;
        Ok(())
    });

    let results = env.run_async().await.unwrap();
    assert_eq!(entries(&order), vec!["awake"]);
    assert_eq!(results.passed_count, 1);
}
