//! Single-slot service queue.
//!
//! A capacity-one semaphore with FIFO hand-off, modelling a node that
//! processes one inbound request at a time. The waiting length is observable
//! so callers can sample queue load, and acquisition is eager: a caller
//! either takes the free slot or joins the waiting line at the moment
//! [`ServiceQueue::acquire`] is called, before the returned future is polled.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Waiter {
    ticket: u64,
    waker: Option<Waker>,
}

struct QueueCore {
    busy: bool,
    waiters: VecDeque<Waiter>,
    granted: Vec<u64>,
    next_ticket: u64,
}

impl QueueCore {
    /// Hand the slot to the next waiter, or free it.
    fn release(&mut self) {
        match self.waiters.pop_front() {
            Some(mut next) => {
                self.granted.push(next.ticket);
                if let Some(waker) = next.waker.take() {
                    waker.wake();
                }
            }
            None => self.busy = false,
        }
    }
}

/// Shared handle to a single-slot queue.
#[derive(Clone)]
pub struct ServiceQueue {
    core: Rc<RefCell<QueueCore>>,
}

impl Default for ServiceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceQueue {
    /// Create an empty queue with a free slot.
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(QueueCore {
                busy: false,
                waiters: VecDeque::new(),
                granted: Vec::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Number of requests waiting for the slot.
    pub fn waiting(&self) -> usize {
        self.core.borrow().waiters.len()
    }

    /// Whether the slot is currently held.
    pub fn is_busy(&self) -> bool {
        self.core.borrow().busy
    }

    /// Take the slot if free, otherwise join the waiting line. The returned
    /// future yields a guard that releases the slot on drop.
    pub fn acquire(&self) -> Acquire {
        let mut core = self.core.borrow_mut();
        let state = if core.busy {
            let ticket = core.next_ticket;
            core.next_ticket += 1;
            core.waiters.push_back(Waiter {
                ticket,
                waker: None,
            });
            AcquireState::Waiting(ticket)
        } else {
            core.busy = true;
            AcquireState::Ready
        };
        Acquire {
            queue: self.clone(),
            state,
        }
    }
}

enum AcquireState {
    /// Slot taken at call time; the guard has not been issued yet.
    Ready,
    /// Queued behind the current holder.
    Waiting(u64),
    /// Guard issued; releasing is the guard's responsibility.
    Claimed,
}

/// Future returned by [`ServiceQueue::acquire`].
pub struct Acquire {
    queue: ServiceQueue,
    state: AcquireState,
}

impl Future for Acquire {
    type Output = SlotGuard;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SlotGuard> {
        let this = self.get_mut();
        match this.state {
            AcquireState::Ready => {
                this.state = AcquireState::Claimed;
                Poll::Ready(SlotGuard {
                    queue: this.queue.clone(),
                })
            }
            AcquireState::Waiting(ticket) => {
                let mut core = this.queue.core.borrow_mut();
                if let Some(pos) = core.granted.iter().position(|&t| t == ticket) {
                    core.granted.swap_remove(pos);
                    drop(core);
                    this.state = AcquireState::Claimed;
                    Poll::Ready(SlotGuard {
                        queue: this.queue.clone(),
                    })
                } else {
                    if let Some(waiter) =
                        core.waiters.iter_mut().find(|w| w.ticket == ticket)
                    {
                        waiter.waker = Some(cx.waker().clone());
                    }
                    Poll::Pending
                }
            }
            AcquireState::Claimed => unreachable!("slot acquired twice"),
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let mut core = self.queue.core.borrow_mut();
        match self.state {
            AcquireState::Ready => core.release(),
            AcquireState::Waiting(ticket) => {
                if let Some(pos) = core.waiters.iter().position(|w| w.ticket == ticket) {
                    core.waiters.remove(pos);
                } else if let Some(pos) = core.granted.iter().position(|&t| t == ticket) {
                    core.granted.swap_remove(pos);
                    core.release();
                }
            }
            AcquireState::Claimed => {}
        }
    }
}

/// Holds the queue slot; dropping it wakes the next waiter.
pub struct SlotGuard {
    queue: ServiceQueue,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.queue.core.borrow_mut().release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SimEnv;

    #[test]
    fn test_free_slot_is_taken_immediately() {
        let queue = ServiceQueue::new();
        assert!(!queue.is_busy());
        let acquire = queue.acquire();
        assert!(queue.is_busy());
        assert_eq!(queue.waiting(), 0);
        drop(acquire);
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_waiting_counts_queued_acquirers() {
        let queue = ServiceQueue::new();
        let _first = queue.acquire();
        let _second = queue.acquire();
        let _third = queue.acquire();
        assert_eq!(queue.waiting(), 2);
    }

    #[test]
    fn test_fifo_hand_off() {
        let env = SimEnv::new();
        let queue = ServiceQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3u32 {
            let inner = env.clone();
            let queue = queue.clone();
            let order = Rc::clone(&order);
            env.spawn(async move {
                let guard = queue.acquire().await;
                inner.timeout(1.0).await;
                order.borrow_mut().push(tag);
                drop(guard);
            });
        }
        env.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(!queue.is_busy());
        assert_eq!(queue.waiting(), 0);
    }

    #[test]
    fn test_release_shrinks_waiting_line() {
        let env = SimEnv::new();
        let queue = ServiceQueue::new();
        let samples = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3u32 {
            let inner = env.clone();
            let queue = queue.clone();
            let samples = Rc::clone(&samples);
            env.spawn(async move {
                let acquire = queue.acquire();
                samples.borrow_mut().push(queue.waiting());
                let guard = acquire.await;
                inner.timeout(1.0).await;
                drop(guard);
                samples.borrow_mut().push(queue.waiting());
            });
        }
        env.run();
        // Entry samples grow by at most one; each release shrinks the line.
        assert_eq!(*samples.borrow(), vec![0, 1, 2, 1, 0, 0]);
    }
}
