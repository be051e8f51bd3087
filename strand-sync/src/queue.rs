//! A bounded queue with coroutine-aware, back-pressured push and pop.
//!
//! The queue is a fixed-capacity ring plus two waiter FIFOs: producers
//! parked because the ring was full (each carrying the value it wants to
//! push), and consumers parked because it was empty. A push into an empty
//! ring with a parked consumer hands the value over directly, skipping the
//! ring; a pop that vacates a slot promotes the oldest parked producer's
//! value into it.
//!
//! All bookkeeping happens under a pluggable [`RawLock`]; wake handles are
//! collected under the lock and dispatched after it is released.

use crate::lock::{Guarded, RawLock, Spinlock};
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;
use strand::{Completion, Fault, Prepared, Promise};

struct PushWaiter<T> {
    value: T,
    done: Completion<()>,
}

struct QueueInner<T> {
    ring: VecDeque<T>,
    push_waiters: VecDeque<PushWaiter<T>>,
    pop_waiters: VecDeque<Completion<T>>,
    closed: Option<Fault>,
}

struct QueueCore<T, L> {
    capacity: usize,
    inner: Guarded<QueueInner<T>, L>,
}

/// A bounded multi-producer, multi-consumer queue with awaitable push and
/// pop. Cheap to clone; clones share the queue.
pub struct Queue<T, L: RawLock = Spinlock> {
    core: Arc<QueueCore<T, L>>,
}

impl<T, L: RawLock> Clone for Queue<T, L> {
    fn clone(&self) -> Self {
        Queue {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Returns a queue holding at most `capacity` buffered items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Queue::with_capacity_and_lock(capacity, Spinlock::new())
    }
}

impl<T: Send + 'static, L: RawLock + 'static> Queue<T, L> {
    /// Returns a queue guarded by the given lock.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity_and_lock(capacity: usize, lock: L) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Queue {
            core: Arc::new(QueueCore {
                capacity,
                inner: Guarded::new(
                    QueueInner {
                        ring: VecDeque::with_capacity(capacity),
                        push_waiters: VecDeque::new(),
                        pop_waiters: VecDeque::new(),
                        closed: None,
                    },
                    lock,
                ),
            }),
        }
    }

    /// Pushes `value`, waiting for room if the ring is full.
    ///
    /// When there is room the push happens immediately, before the returned
    /// promise is awaited. Only a push deferred by a full ring requires the
    /// promise to be awaited; dropping such a promise abandons the push.
    pub fn push(&self, value: T) -> Promise<()> {
        let mut wake = Prepared::none();
        let deferred = self.core.inner.with(|inner| {
            if inner.ring.len() >= self.core.capacity {
                return Some(value);
            }
            wake = inner.accept(value);
            None
        });
        wake.resume();
        let Some(value) = deferred else {
            return Promise::from_value(());
        };

        let core = self.core.clone();
        let mut value = Some(value);
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            let value = value.take().expect("push producer ran twice");
            let mut done = Some(completion);
            let mut wake = Prepared::none();
            core.inner.with(|inner| {
                if inner.ring.len() >= core.capacity {
                    inner.push_waiters.push_back(PushWaiter {
                        value,
                        done: done.take().expect("completion consumed twice"),
                    });
                } else {
                    wake = inner.accept(value);
                }
            });
            match done {
                // Room appeared between the full check and the await.
                Some(completion) => {
                    wake.resume();
                    completion.complete(())
                }
                None => wake,
            }
        })
    }

    /// Pops the oldest item, waiting for one if the queue is empty.
    ///
    /// When an item is buffered it is taken immediately, before the
    /// returned promise is awaited. If the queue was [closed](Self::close)
    /// with an error, pops past the buffered items fail with that fault.
    pub fn pop(&self) -> Promise<T> {
        let mut wake = Prepared::none();
        let taken = self.core.inner.with(|inner| match inner.take() {
            Some((value, promoted)) => {
                wake = promoted;
                Some(value)
            }
            None => None,
        });
        wake.resume();
        if let Some(value) = taken {
            return Promise::from_value(value);
        }

        let core = self.core.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            let mut parked = Some(completion);
            let mut wake = Prepared::none();
            let outcome = core.inner.with(|inner| match inner.take() {
                Some((value, promoted)) => {
                    wake = promoted;
                    Some(Ok(value))
                }
                None => match &inner.closed {
                    Some(fault) => Some(Err(fault.clone())),
                    None => {
                        inner
                            .pop_waiters
                            .push_back(parked.take().expect("completion consumed twice"));
                        None
                    }
                },
            });
            match (outcome, parked) {
                (Some(Ok(value)), Some(completion)) => {
                    wake.resume();
                    completion.complete(value)
                }
                (Some(Err(fault)), Some(completion)) => completion.fail_fault(fault),
                _ => Prepared::none(),
            }
        })
    }

    /// Pops until the ring is empty, discarding the items.
    ///
    /// Parked producers are promoted (and resumed) along the way, so this
    /// also unblocks a stalled producer side during shutdown.
    pub fn clear(&self) {
        loop {
            let promise = self.pop();
            if !promise.is_ready() {
                // An unawaited deferred pop registers nothing.
                break;
            }
            drop(promise);
        }
    }

    /// Closes the queue with `fault`: every parked consumer fails with the
    /// fault now, and future pops fail once the buffer is drained.
    ///
    /// Buffered items and parked producers are untouched; consumers can
    /// still drain everything that was already accepted.
    pub fn close(&self, fault: Fault) {
        let parked = self.core.inner.with(|inner| {
            inner.closed = Some(fault.clone());
            core::mem::take(&mut inner.pop_waiters)
        });
        test_debug!(parked = parked.len(), "Queue::close");
        for waiter in parked {
            waiter.fail_fault(fault.clone()).resume();
        }
    }

    /// Reopens a closed queue.
    pub fn reopen(&self) {
        self.core.inner.with(|inner| inner.closed = None);
    }

    /// Number of items currently buffered in the ring.
    pub fn len(&self) -> usize {
        self.core.inner.with(|inner| inner.ring.len())
    }

    /// Returns `true` if no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ring capacity.
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Returns `true` if the queue is closed.
    pub fn is_closed(&self) -> bool {
        self.core.inner.with(|inner| inner.closed.is_some())
    }
}

impl<T: Send + 'static> QueueInner<T> {
    /// Accepts a value into the queue: hand it to a parked consumer if the
    /// ring is empty, otherwise buffer it. The caller has checked for room.
    fn accept(&mut self, value: T) -> Prepared {
        if self.ring.is_empty() {
            if let Some(waiter) = self.pop_waiters.pop_front() {
                return waiter.complete(value);
            }
        }
        self.ring.push_back(value);
        Prepared::none()
    }

    /// Takes the oldest buffered value, promoting a parked producer into
    /// the vacated slot.
    fn take(&mut self) -> Option<(T, Prepared)> {
        let value = self.ring.pop_front()?;
        let wake = match self.push_waiters.pop_front() {
            Some(waiter) => {
                self.ring.push_back(waiter.value);
                waiter.done.complete(())
            }
            None => Prepared::none(),
        };
        Some((value, wake))
    }
}

impl<T, L: RawLock> fmt::Debug for Queue<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.core.capacity)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
