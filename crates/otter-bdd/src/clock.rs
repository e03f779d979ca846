//! Virtual clock
//!
//! [`FakeTimer`] is a deterministic stand-in for the host timers, advanced
//! explicitly with [`FakeTimer::tick`]. [`Clock`] is the facade the scheduler
//! and specs schedule through: it routes to the fake timer while the mock is
//! installed and to the real [`EventLoop`] otherwise.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, TimerId};

enum FakeCallback {
    Once(Box<dyn FnOnce()>),
    Repeating(Rc<dyn Fn()>),
}

struct ScheduledFunction {
    fire_at: u64,
    interval_ms: u64,
    callback: FakeCallback,
}

#[derive(Default)]
struct FakeTimerState {
    now_ms: u64,
    timeouts_made: u64,
    scheduled: BTreeMap<u64, ScheduledFunction>,
}

/// Mock setTimeout/setInterval driven by [`FakeTimer::tick`]
#[derive(Default)]
pub struct FakeTimer {
    state: RefCell<FakeTimerState>,
}

impl FakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every scheduled function and rewind virtual time to zero.
    pub fn reset(&self) {
        *self.state.borrow_mut() = FakeTimerState::default();
    }

    /// Virtual milliseconds elapsed since the last reset
    pub fn now_ms(&self) -> u64 {
        self.state.borrow().now_ms
    }

    pub fn set_timeout<F>(&self, callback: F, delay: Duration) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        self.schedule(FakeCallback::Once(Box::new(callback)), as_millis(delay))
    }

    /// Zero intervals are bumped to 1ms so a tick always terminates.
    pub fn set_interval<F>(&self, callback: F, interval: Duration) -> TimerId
    where
        F: Fn() + 'static,
    {
        self.schedule(
            FakeCallback::Repeating(Rc::new(callback)),
            as_millis(interval).max(1),
        )
    }

    fn schedule(&self, callback: FakeCallback, millis: u64) -> TimerId {
        let mut state = self.state.borrow_mut();
        state.timeouts_made += 1;
        let key = state.timeouts_made;
        let fire_at = state.now_ms.saturating_add(millis);
        state.scheduled.insert(
            key,
            ScheduledFunction {
                fire_at,
                interval_ms: millis,
                callback,
            },
        );
        TimerId(key)
    }

    pub fn clear(&self, id: TimerId) -> bool {
        self.state.borrow_mut().scheduled.remove(&id.0).is_some()
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().scheduled.len()
    }

    /// Advance virtual time by `millis`, firing everything that falls due.
    /// A callback that ticks again can only move time further forward.
    pub fn tick(&self, millis: Duration) {
        let target = self.now_ms().saturating_add(as_millis(millis));
        self.run_functions_until(target);
        let mut state = self.state.borrow_mut();
        state.now_ms = state.now_ms.max(target);
    }

    /// Fire due functions one at a time, earliest first (ties by schedule
    /// order). Virtual now is moved to each function's fire time before it
    /// runs, so anything it schedules lands relative to that time and is
    /// picked up by the same scan when it still falls inside the window.
    fn run_functions_until(&self, target: u64) {
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let due = state
                    .scheduled
                    .iter()
                    .filter(|(_, f)| f.fire_at <= target)
                    .min_by_key(|(key, f)| (f.fire_at, **key))
                    .map(|(key, f)| (*key, f.fire_at));
                let Some((key, fire_at)) = due else {
                    break;
                };
                state.now_ms = state.now_ms.max(fire_at);

                let repeating = match state.scheduled.get_mut(&key) {
                    Some(ScheduledFunction {
                        callback: FakeCallback::Repeating(f),
                        interval_ms,
                        fire_at,
                    }) => match fire_at.checked_add(*interval_ms) {
                        // Reschedule relative to the fire time before the
                        // call, so the callback can still clear itself.
                        Some(next) => {
                            *fire_at = next;
                            Some(Rc::clone(f))
                        }
                        // Out of virtual time: this is the last firing.
                        None => None,
                    },
                    _ => None,
                };
                match repeating {
                    Some(f) => FakeCallback::Repeating(f),
                    None => match state.scheduled.remove(&key) {
                        Some(scheduled) => scheduled.callback,
                        None => break,
                    },
                }
            };

            match next {
                FakeCallback::Once(f) => f(),
                FakeCallback::Repeating(f) => f(),
            }
        }
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A timer created through the [`Clock`], remembering which backend owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerHandle {
    Real(TimerId),
    Fake(TimerId),
}

/// Timer facade shared by the scheduler and specs
pub struct Clock {
    fake: FakeTimer,
    installed: Cell<bool>,
    host: EventLoop,
}

impl Clock {
    pub fn new(host: EventLoop) -> Self {
        Self {
            fake: FakeTimer::new(),
            installed: Cell::new(false),
            host,
        }
    }

    pub fn set_timeout<F>(&self, callback: F, delay: Duration) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        if self.is_installed() {
            TimerHandle::Fake(self.fake.set_timeout(callback, delay))
        } else {
            TimerHandle::Real(self.host.set_timeout(callback, delay))
        }
    }

    pub fn set_interval<F>(&self, callback: F, interval: Duration) -> TimerHandle
    where
        F: Fn() + 'static,
    {
        if self.is_installed() {
            TimerHandle::Fake(self.fake.set_interval(callback, interval))
        } else {
            TimerHandle::Real(self.host.set_interval(callback, interval))
        }
    }

    /// Clear a timer on whichever backend created it.
    pub fn clear(&self, handle: TimerHandle) -> bool {
        match handle {
            TimerHandle::Real(id) => self.host.clear_timer(id),
            TimerHandle::Fake(id) => self.fake.clear(id),
        }
    }

    pub fn install_mock(&self) {
        self.installed.set(true);
    }

    pub fn uninstall_mock(&self) -> Result<()> {
        self.assert_installed()?;
        self.installed.set(false);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get()
    }

    fn assert_installed(&self) -> Result<()> {
        if self.is_installed() {
            Ok(())
        } else {
            Err(Error::ClockNotInstalled)
        }
    }

    pub fn tick(&self, millis: Duration) -> Result<()> {
        self.assert_installed()?;
        self.fake.tick(millis);
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.assert_installed()?;
        self.fake.reset();
        Ok(())
    }

    pub fn fake_timer(&self) -> &FakeTimer {
        &self.fake
    }

    pub fn host(&self) -> &EventLoop {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |label: &str| -> Box<dyn FnOnce()> {
            let log = log_clone.clone();
            let label = label.to_string();
            Box::new(move || log.borrow_mut().push(label))
        };
        (log, make)
    }

    #[test]
    fn test_tick_fires_due_callbacks_in_order() {
        let timer = FakeTimer::new();
        let (log, make) = recorder();

        timer.set_timeout(make("60"), Duration::from_millis(60));
        timer.set_timeout(make("40"), Duration::from_millis(40));
        timer.set_timeout(make("10"), Duration::from_millis(10));

        timer.tick(Duration::from_millis(50));
        assert_eq!(*log.borrow(), vec!["10", "40"]);
        assert_eq!(timer.now_ms(), 50);
        assert_eq!(timer.pending(), 1);

        timer.tick(Duration::from_millis(10));
        assert_eq!(*log.borrow(), vec!["10", "40", "60"]);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let timer = FakeTimer::new();
        let (log, make) = recorder();
        timer.set_timeout(make("edge"), Duration::from_millis(100));

        timer.tick(Duration::from_millis(99));
        assert!(log.borrow().is_empty());
        timer.tick(Duration::from_millis(1));
        assert_eq!(*log.borrow(), vec!["edge"]);
    }

    #[test]
    fn test_callbacks_scheduled_inside_window_fire_same_tick() {
        let timer = Rc::new(FakeTimer::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner_timer = timer.clone();
        let inner_log = log.clone();
        timer.set_timeout(
            move || {
                inner_log.borrow_mut().push(inner_timer.now_ms());
                let nested_log = inner_log.clone();
                let nested_timer = inner_timer.clone();
                inner_timer.set_timeout(
                    move || nested_log.borrow_mut().push(nested_timer.now_ms()),
                    Duration::from_millis(15),
                );
            },
            Duration::from_millis(10),
        );

        timer.tick(Duration::from_millis(30));
        assert_eq!(*log.borrow(), vec![10, 25]);
    }

    #[test]
    fn test_interval_reschedules_from_fire_time() {
        let timer = Rc::new(FakeTimer::new());
        let fired_at = Rc::new(RefCell::new(Vec::new()));

        let fired = fired_at.clone();
        let clock = timer.clone();
        timer.set_interval(
            move || fired.borrow_mut().push(clock.now_ms()),
            Duration::from_millis(20),
        );

        timer.tick(Duration::from_millis(65));
        assert_eq!(*fired_at.borrow(), vec![20, 40, 60]);
        timer.tick(Duration::from_millis(15));
        assert_eq!(*fired_at.borrow(), vec![20, 40, 60, 80]);
    }

    #[test]
    fn test_interval_can_clear_itself() {
        let timer = Rc::new(FakeTimer::new());
        let count = Rc::new(Cell::new(0));
        let id_holder = Rc::new(Cell::new(None::<TimerId>));

        let (count_clone, timer_clone, id_clone) = (count.clone(), timer.clone(), id_holder.clone());
        let id = timer.set_interval(
            move || {
                count_clone.set(count_clone.get() + 1);
                if let Some(id) = id_clone.get() {
                    timer_clone.clear(id);
                }
            },
            Duration::from_millis(5),
        );
        id_holder.set(Some(id));

        timer.tick(Duration::from_millis(100));
        assert_eq!(count.get(), 1);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_huge_delay_saturates_instead_of_wrapping() {
        let timer = FakeTimer::new();
        let (log, make) = recorder();

        timer.tick(Duration::from_millis(10));
        timer.set_timeout(make("far"), Duration::MAX);
        timer.tick(Duration::from_millis(1_000));
        assert!(log.borrow().is_empty());
        assert_eq!(timer.pending(), 1);

        timer.tick(Duration::MAX);
        assert_eq!(timer.now_ms(), u64::MAX);
        assert_eq!(*log.borrow(), vec!["far"]);
    }

    #[test]
    fn test_interval_at_end_of_time_fires_once() {
        let timer = FakeTimer::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        timer.tick(Duration::from_millis(u64::MAX - 5));
        timer.set_interval(move || counter.set(counter.get() + 1), Duration::from_millis(5));

        timer.tick(Duration::from_millis(10));
        assert_eq!(count.get(), 1);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_nested_tick_never_rewinds_time() {
        let timer = Rc::new(FakeTimer::new());
        let inner = timer.clone();
        timer.set_timeout(move || inner.tick(Duration::from_millis(20)), Duration::from_millis(5));

        timer.tick(Duration::from_millis(10));
        assert_eq!(timer.now_ms(), 25);
    }

    #[test]
    fn test_cleared_timeout_does_not_fire() {
        let timer = FakeTimer::new();
        let (log, make) = recorder();
        let id = timer.set_timeout(make("never"), Duration::from_millis(5));
        assert!(timer.clear(id));
        timer.tick(Duration::from_millis(10));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_clock_routes_by_installation() {
        let clock = Clock::new(EventLoop::new());
        assert!(matches!(
            clock.set_timeout(|| {}, Duration::from_millis(1)),
            TimerHandle::Real(_)
        ));
        assert!(matches!(
            clock.tick(Duration::from_millis(1)),
            Err(Error::ClockNotInstalled)
        ));
        assert!(matches!(clock.uninstall_mock(), Err(Error::ClockNotInstalled)));

        clock.install_mock();
        let handle = clock.set_timeout(|| {}, Duration::from_millis(1));
        assert!(matches!(handle, TimerHandle::Fake(_)));
        assert!(clock.clear(handle));
        clock.tick(Duration::from_millis(1)).unwrap();
        clock.uninstall_mock().unwrap();
        assert!(!clock.is_installed());
    }
}
