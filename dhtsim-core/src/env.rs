//! Discrete-event scheduler and cooperative task executor.
//!
//! The environment multiplexes cooperative tasks onto one logical thread of
//! control. Pending wakeups sit in a priority queue keyed by
//! `(time, sequence)`; the run loop pops the earliest wakeup, advances the
//! virtual clock, wakes the timer's waiter, then polls every ready task until
//! the current instant is quiescent. Ties between same-time wakeups resolve
//! in scheduling order, so a run is fully deterministic for a fixed seed.
//!
//! Suspension happens only at explicit await points: timeouts, queue
//! acquisition and request resolution. No real threads are involved; the
//! waker plumbing goes through a mutex-guarded ready list purely to satisfy
//! the `Waker` contract.

use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use hashbrown::HashMap;

use crate::request::{channel, Request};
use crate::time::SimTime;

/// Identifier of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TaskId(u64);

/// Identifier of a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TimerId(u64);

/// A scheduled wakeup with timestamp and sequence number for ordering.
struct Wakeup {
    time: SimTime,
    seq: u64,
    timer: TimerId,
}

// Reverse ordering for min-heap behaviour (BinaryHeap is a max-heap).
impl PartialEq for Wakeup {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Wakeup {}

impl PartialOrd for Wakeup {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wakeup {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.time.cmp(&self.time) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct TimerSlot {
    fired: bool,
    waker: Option<Waker>,
}

type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

struct EnvCore {
    now: SimTime,
    next_seq: u64,
    next_serial: u64,
    wakeups: BinaryHeap<Wakeup>,
    timers: HashMap<TimerId, TimerSlot>,
    next_timer: u64,
    tasks: HashMap<TaskId, LocalTask>,
    next_task: u64,
}

impl EnvCore {
    fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_seq: 0,
            next_serial: 0,
            wakeups: BinaryHeap::new(),
            timers: HashMap::new(),
            next_timer: 0,
            tasks: HashMap::new(),
            next_task: 0,
        }
    }
}

/// FIFO list of tasks ready to be polled at the current instant.
#[derive(Default)]
struct ReadyQueue {
    ids: Mutex<VecDeque<TaskId>>,
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.ids.lock().unwrap().push_back(self.id);
    }
}

/// Handle to the simulation environment. Cheap to clone; every clone refers
/// to the same clock, wakeup queue and task set.
#[derive(Clone)]
pub struct SimEnv {
    core: Rc<RefCell<EnvCore>>,
    ready: Arc<ReadyQueue>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Create an environment with the clock at zero.
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(EnvCore::new())),
            ready: Arc::new(ReadyQueue::default()),
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.core.borrow().now
    }

    /// Next value of the monotonically increasing serial counter, used to tag
    /// packets for tracing.
    pub fn next_serial(&self) -> u64 {
        let mut core = self.core.borrow_mut();
        let serial = core.next_serial;
        core.next_serial += 1;
        serial
    }

    /// A future that completes after `delay` units of simulated time.
    pub fn timeout(&self, delay: f64) -> Timeout {
        let mut core = self.core.borrow_mut();
        let timer = TimerId(core.next_timer);
        core.next_timer += 1;
        core.timers.insert(
            timer,
            TimerSlot {
                fired: false,
                waker: None,
            },
        );
        let time = core.now + delay.max(0.0);
        let seq = core.next_seq;
        core.next_seq += 1;
        core.wakeups.push(Wakeup { time, seq, timer });
        Timeout {
            env: self.clone(),
            timer,
        }
    }

    /// Schedule a cooperative task. The task starts at the current instant,
    /// after already-ready tasks; its output resolves the returned request.
    pub fn spawn<F, T>(&self, fut: F) -> Request<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let (request, resolver) = channel();
        let task: LocalTask = Box::pin(async move {
            // The handle may have been abandoned; that resolution is a no-op.
            let _ = resolver.resolve(fut.await);
        });
        let id = {
            let mut core = self.core.borrow_mut();
            let id = TaskId(core.next_task);
            core.next_task += 1;
            core.tasks.insert(id, task);
            id
        };
        self.ready.ids.lock().unwrap().push_back(id);
        request
    }

    /// Run until the wakeup queue is exhausted.
    pub fn run(&self) {
        self.drain_ready();
        while self.fire_next(None) {
            self.drain_ready();
        }
    }

    /// Run every wakeup scheduled up to and including `limit`, then advance
    /// the clock to `limit`.
    pub fn run_until(&self, limit: SimTime) {
        self.drain_ready();
        while self.fire_next(Some(limit)) {
            self.drain_ready();
        }
        let mut core = self.core.borrow_mut();
        if limit > core.now {
            core.now = limit;
        }
    }

    /// True when no wakeups remain.
    pub fn is_quiescent(&self) -> bool {
        self.core.borrow().wakeups.is_empty()
    }

    /// Pop the earliest wakeup within `limit`, advance the clock and wake the
    /// timer's waiter. Returns false when nothing eligible remains.
    fn fire_next(&self, limit: Option<SimTime>) -> bool {
        let waker = {
            let mut core = self.core.borrow_mut();
            let eligible = match core.wakeups.peek() {
                Some(w) => limit.map_or(true, |l| w.time <= l),
                None => false,
            };
            if !eligible {
                return false;
            }
            let wakeup = match core.wakeups.pop() {
                Some(w) => w,
                None => return false,
            };
            core.now = wakeup.time;
            match core.timers.get_mut(&wakeup.timer) {
                Some(slot) => {
                    slot.fired = true;
                    slot.waker.take()
                }
                // Abandoned timer: the clock still advances, nobody wakes.
                None => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Poll ready tasks until the current instant settles. Tasks are taken
    /// out of the registry while polled so they can freely schedule timers
    /// and spawn further tasks.
    fn drain_ready(&self) {
        loop {
            let id = match self.ready.ids.lock().unwrap().pop_front() {
                Some(id) => id,
                None => break,
            };
            let mut task = match self.core.borrow_mut().tasks.remove(&id) {
                Some(task) => task,
                // Spurious wake of a completed task.
                None => continue,
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: Arc::clone(&self.ready),
            }));
            let mut cx = Context::from_waker(&waker);
            if task.as_mut().poll(&mut cx).is_pending() {
                self.core.borrow_mut().tasks.insert(id, task);
            }
        }
    }
}

/// Future returned by [`SimEnv::timeout`].
pub struct Timeout {
    env: SimEnv,
    timer: TimerId,
}

impl Future for Timeout {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut core = self.env.core.borrow_mut();
        match core.timers.get_mut(&self.timer) {
            Some(slot) if slot.fired => Poll::Ready(()),
            Some(slot) => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.env.core.borrow_mut().timers.remove(&self.timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_starts_at_zero() {
        let env = SimEnv::new();
        assert_eq!(env.now(), SimTime::ZERO);
        assert!(env.is_quiescent());
    }

    #[test]
    fn test_timeout_advances_clock() {
        let env = SimEnv::new();
        let inner = env.clone();
        let done = env.spawn(async move {
            inner.timeout(3.5).await;
            inner.now()
        });
        env.run();
        assert_eq!(done.try_take(), Some(SimTime::new(3.5)));
        assert_eq!(env.now(), SimTime::new(3.5));
    }

    #[test]
    fn test_timeouts_fire_in_time_order() {
        let env = SimEnv::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (tag, delay) in [(0u32, 3.0), (1, 1.0), (2, 2.0)] {
            let inner = env.clone();
            let order = Rc::clone(&order);
            env.spawn(async move {
                inner.timeout(delay).await;
                order.borrow_mut().push(tag);
            });
        }
        env.run();
        assert_eq!(*order.borrow(), vec![1, 2, 0]);
    }

    #[test]
    fn test_same_time_wakeups_run_in_schedule_order() {
        let env = SimEnv::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..5u32 {
            let inner = env.clone();
            let order = Rc::clone(&order);
            env.spawn(async move {
                inner.timeout(1.0).await;
                order.borrow_mut().push(tag);
            });
        }
        env.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_run_until_stops_at_limit() {
        let env = SimEnv::new();
        let inner = env.clone();
        let late = env.spawn(async move {
            inner.timeout(10.0).await;
        });
        env.run_until(SimTime::new(4.0));
        assert_eq!(env.now(), SimTime::new(4.0));
        assert!(late.try_take().is_none());
        env.run_until(SimTime::new(10.0));
        assert!(late.try_take().is_some());
    }

    #[test]
    fn test_spawned_task_can_spawn() {
        let env = SimEnv::new();
        let inner = env.clone();
        let result = env.spawn(async move {
            let nested = inner.spawn(async { 7u32 });
            inner.timeout(1.0).await;
            nested.try_take()
        });
        env.run();
        assert_eq!(result.try_take(), Some(Some(7)));
    }

    #[test]
    fn test_serial_counter_is_monotonic() {
        let env = SimEnv::new();
        let a = env.next_serial();
        let b = env.next_serial();
        assert!(b > a);
    }
}
