//! One-shot request futures and the timed multi-wait combinator.
//!
//! A [`Request`] is the waiting half of a pending reply: it resolves at most
//! once, with whatever the [`Resolver`] delivers. The resolver travels with
//! the outbound message; resolving a second time is a contract violation.
//! A waiter that timed out simply abandons its request, and any late
//! resolution becomes a no-op.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::env::Timeout;
use crate::error::{PartialTimeout, ProtocolViolation};

struct Shared<T> {
    value: Option<T>,
    resolved: bool,
    waker: Option<Waker>,
}

/// Waiting half of a one-shot exchange. Consumed by at most one waiter.
pub struct Request<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

/// Resolving half of a one-shot exchange.
pub struct Resolver<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

/// Create a connected request/resolver pair.
pub fn channel<T>() -> (Request<T>, Resolver<T>) {
    let shared = Rc::new(RefCell::new(Shared {
        value: None,
        resolved: false,
        waker: None,
    }));
    (
        Request {
            shared: Rc::clone(&shared),
        },
        Resolver { shared },
    )
}

impl<T> Resolver<T> {
    /// Fire the request with `value`. Errors if the request already fired;
    /// firing after the waiter gave up succeeds silently.
    pub fn resolve(&self, value: T) -> Result<(), ProtocolViolation> {
        let mut shared = self.shared.borrow_mut();
        if shared.resolved {
            return Err(ProtocolViolation);
        }
        shared.resolved = true;
        shared.value = Some(value);
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Whether the request already fired.
    pub fn is_resolved(&self) -> bool {
        self.shared.borrow().resolved
    }
}

impl<T> Request<T> {
    /// Take the value if the request has fired and nobody consumed it yet.
    pub fn try_take(&self) -> Option<T> {
        self.shared.borrow_mut().value.take()
    }
}

impl<T> Future for Request<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut shared = self.shared.borrow_mut();
        match shared.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Wait for every request or the timeout, whichever comes first.
///
/// Completes with all values once every member fires; if the timeout wins it
/// yields the subset received so far, preserving the "some but not all
/// responded" distinction.
pub fn race_all<T: std::fmt::Debug>(requests: Vec<Request<T>>, timeout: Timeout) -> RaceAll<T> {
    let expected = requests.len();
    RaceAll {
        slots: requests.into_iter().map(Some).collect(),
        received: Vec::with_capacity(expected),
        expected,
        timeout,
    }
}

/// Future returned by [`race_all`].
pub struct RaceAll<T: std::fmt::Debug> {
    slots: Vec<Option<Request<T>>>,
    received: Vec<T>,
    expected: usize,
    timeout: Timeout,
}

impl<T: std::fmt::Debug + Unpin> Future for RaceAll<T> {
    type Output = Result<Vec<T>, PartialTimeout<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for slot in this.slots.iter_mut() {
            if let Some(request) = slot {
                if let Poll::Ready(value) = Pin::new(request).poll(cx) {
                    this.received.push(value);
                    *slot = None;
                }
            }
        }
        if this.received.len() == this.expected {
            return Poll::Ready(Ok(std::mem::take(&mut this.received)));
        }
        match Pin::new(&mut this.timeout).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(PartialTimeout {
                received: std::mem::take(&mut this.received),
                expected: this.expected,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
