//! Real-time host event loop
//!
//! Single-threaded timer loop the scheduler yields to. Timers live in a map
//! keyed by id with a min-heap of deadlines beside it; stale heap entries
//! (cleared or rescheduled timers) are skipped when popped. A delay too far
//! out to represent as an `Instant` parks the timer: it never fires and does
//! not keep the loop alive, but can still be cleared.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) enum TimerCallback {
    Once(Option<Box<dyn FnOnce()>>),
    Repeating(Rc<dyn Fn()>),
}

/// Helper enum for extracting callbacks during timer execution
enum CallbackToRun {
    Once(Box<dyn FnOnce()>),
    Repeating(Rc<dyn Fn()>),
}

struct Timer {
    /// `None` when the delay overflows `Instant`
    deadline: Option<Instant>,
    interval: Option<Duration>,
    callback: TimerCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerHeapEntry {
    deadline: Instant,
    id: u64,
}

impl Ord for TimerHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // first and insertion order among equal deadlines.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct EventLoopInner {
    /// Timer storage by ID
    timers: RefCell<HashMap<u64, Timer>>,
    /// Min-heap ordered by deadline
    timer_heap: RefCell<BinaryHeap<TimerHeapEntry>>,
    next_timer_id: Cell<u64>,
}

/// Host event loop. Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<EventLoopInner>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EventLoopInner {
                timers: RefCell::new(HashMap::new()),
                timer_heap: RefCell::new(BinaryHeap::new()),
                next_timer_id: Cell::new(1),
            }),
        }
    }

    /// Schedule a one-shot timeout (setTimeout)
    pub fn set_timeout<F>(&self, callback: F, delay: Duration) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        self.insert_timer(TimerCallback::Once(Some(Box::new(callback))), delay, None)
    }

    /// Schedule a repeating interval (setInterval)
    pub fn set_interval<F>(&self, callback: F, interval: Duration) -> TimerId
    where
        F: Fn() + 'static,
    {
        self.insert_timer(
            TimerCallback::Repeating(Rc::new(callback)),
            interval,
            Some(interval),
        )
    }

    fn insert_timer(
        &self,
        callback: TimerCallback,
        delay: Duration,
        interval: Option<Duration>,
    ) -> TimerId {
        let id = self.inner.next_timer_id.get();
        self.inner.next_timer_id.set(id + 1);
        let deadline = Instant::now().checked_add(delay);
        if deadline.is_none() {
            tracing::trace!(timer = id, ?delay, "delay out of range; timer parked");
        }

        self.inner.timers.borrow_mut().insert(
            id,
            Timer {
                deadline,
                interval,
                callback,
            },
        );
        if let Some(deadline) = deadline {
            self.inner
                .timer_heap
                .borrow_mut()
                .push(TimerHeapEntry { deadline, id });
        }
        TimerId(id)
    }

    /// Cancel a timer by ID. Works from inside the timer's own callback.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().remove(&id.0).is_some()
    }

    /// Check if any timer keeps the loop alive. Parked timers do not.
    pub fn has_pending_tasks(&self) -> bool {
        self.inner
            .timers
            .borrow()
            .values()
            .any(|t| t.deadline.is_some())
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.inner
            .timers
            .borrow()
            .values()
            .filter_map(|t| t.deadline)
            .min()
    }

    /// Run every timer whose deadline has passed. Returns how many ran.
    pub fn poll(&self) -> usize {
        let now = Instant::now();

        // Collect due timer IDs from the heap
        let mut due_ids = Vec::new();
        {
            let mut heap = self.inner.timer_heap.borrow_mut();
            let timers = self.inner.timers.borrow();
            while let Some(&entry) = heap.peek() {
                if entry.deadline > now {
                    break;
                }
                heap.pop();
                if let Some(timer) = timers.get(&entry.id)
                    && timer.deadline == Some(entry.deadline)
                {
                    due_ids.push(entry.id);
                }
            }
        }

        let mut ran = 0;
        for timer_id in due_ids {
            // Extract the callback without holding a borrow across the call:
            // callbacks schedule and clear timers themselves.
            let callback = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.get_mut(&timer_id) {
                    None => continue,
                    Some(timer) => match &mut timer.callback {
                        TimerCallback::Once(cb) => {
                            let cb = cb.take();
                            timers.remove(&timer_id);
                            cb.map(CallbackToRun::Once)
                        }
                        TimerCallback::Repeating(cb) => {
                            let cb = Rc::clone(cb);
                            if let Some(interval) = timer.interval {
                                timer.deadline = Instant::now().checked_add(interval);
                                if let Some(deadline) = timer.deadline {
                                    self.inner.timer_heap.borrow_mut().push(TimerHeapEntry {
                                        deadline,
                                        id: timer_id,
                                    });
                                }
                            }
                            Some(CallbackToRun::Repeating(cb))
                        }
                    },
                }
            };

            match callback {
                Some(CallbackToRun::Once(f)) => f(),
                Some(CallbackToRun::Repeating(f)) => f(),
                None => continue,
            }
            ran += 1;
        }

        ran
    }

    /// Get time until next timer
    fn time_until_next_timer(&self) -> Option<Duration> {
        self.next_timer_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Block the current thread until no timers remain.
    pub fn run_until_complete(&self) {
        loop {
            self.poll();
            if !self.has_pending_tasks() {
                break;
            }
            if let Some(wait) = self.time_until_next_timer()
                && !wait.is_zero()
            {
                std::thread::sleep(wait);
            }
        }
    }

    /// Drain the loop from inside a tokio runtime without blocking it.
    pub async fn run_until_complete_async(&self) {
        loop {
            self.poll();
            if !self.has_pending_tasks() {
                break;
            }
            tokio::task::yield_now().await;
            if let Some(wait) = self.time_until_next_timer()
                && !wait.is_zero()
            {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
